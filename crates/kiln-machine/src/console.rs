use std::io::{self, Write};

/// Write-only console device.
pub struct Console {
    out: Box<dyn Write + Send>,
}

impl Console {
    pub fn stdout() -> Self {
        Self {
            out: Box::new(io::stdout()),
        }
    }

    pub fn to_writer(out: impl Write + Send + 'static) -> Self {
        Self { out: Box::new(out) }
    }

    pub fn put_string(&mut self, s: &str) -> io::Result<()> {
        self.out.write_all(s.as_bytes())?;
        self.out.flush()
    }
}
