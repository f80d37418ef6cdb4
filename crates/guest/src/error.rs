use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    /// The module declares an import the host does not provide.
    #[error("unknown import `{0}`")]
    UnknownImport(String),
    /// The engine rejected the executable bytes.
    #[error("invalid executable image: {0}")]
    BadImage(String),
    /// A required export is missing from the module.
    #[error("export `{0}` is not defined")]
    MissingExport(&'static str),
}
