//! Logger setup. Records go to stderr and are appended to the log file in the
//! state directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Writes every record to `primary`, and to `secondary` while it keeps working.
pub struct Tee<A, B> {
    primary: A,
    secondary: Option<B>,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(primary: A, secondary: Option<B>) -> Self {
        Self { primary, secondary }
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        if let Some(file) = self.secondary.as_mut() {
            if let Err(e) = file.write_all(buf) {
                // Can't log from inside the logger.
                eprintln!("log file write failed, continuing on stderr only: {e}");
                self.secondary = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.secondary.as_mut() {
            if file.flush().is_err() {
                self.secondary = None;
            }
        }
        self.primary.flush()
    }
}

/// Open `path` for appending, creating it and its directory if needed.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global logger. `RUST_LOG` overrides the default `info` filter.
pub fn init(log_file: Option<File>) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(Tee::new(io::stderr(), log_file))))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tee_writes_both_sinks() {
        let mut tee = Tee::new(Vec::new(), Some(Vec::new()));
        tee.write_all(b"[info] hello\n").unwrap();
        tee.flush().unwrap();
        assert_eq!(tee.primary, b"[info] hello\n");
        assert_eq!(tee.secondary.as_deref(), Some(&b"[info] hello\n"[..]));
    }

    #[test]
    fn test_broken_file_sink_is_dropped() {
        let mut tee = Tee::new(Vec::new(), Some(Broken));
        tee.write_all(b"first\n").unwrap();
        tee.write_all(b"second\n").unwrap();
        assert_eq!(tee.primary, b"first\nsecond\n");
        assert!(tee.secondary.is_none());
    }

    #[test]
    fn test_log_file_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("vidgrab.log");

        open_log_file(&path).unwrap().write_all(b"run one\n").unwrap();
        open_log_file(&path).unwrap().write_all(b"run two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "run one\nrun two\n");
    }
}
