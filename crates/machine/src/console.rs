use std::io::{self, Write};

/// Sink for guest console output.
pub trait Console: Send {
    fn write(&mut self, text: &str);
}

/// Forwards guest output to the host's stdout, unbuffered.
#[derive(Debug, Default)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn write(&mut self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}
