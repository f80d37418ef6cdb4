/// Where a user executable sits in the arena and where its relocatable
/// segments were placed.
///
/// The code bytes live in `[bin_start, bin_end)`. `data_start` and
/// `table_start` become the image's `__memory_base` and `__table_base` at
/// instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserImageSpec {
    pub bin_start: u32,
    pub bin_end: u32,
    pub data_start: u32,
    pub table_start: u32,
}
