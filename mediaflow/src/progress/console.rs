//! Human-readable progress for interactive use.

use super::ProgressReporter;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

/// Writes one line per progress call to stderr or any writer.
///
/// Step updates are shown only in verbose mode. Write errors are ignored.
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
    verbose: bool,
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::stderr(false)
    }
}

impl ConsoleReporter {
    /// A reporter writing to stderr.
    #[must_use]
    pub fn stderr(verbose: bool) -> Self {
        Self::with_writer(Box::new(io::stderr()), verbose)
    }

    /// A reporter writing to `out`.
    #[must_use]
    pub fn with_writer(out: Box<dyn Write + Send>, verbose: bool) -> Self {
        Self {
            out: Mutex::new(out),
            verbose,
        }
    }

    fn line(&self, args: fmt::Arguments<'_>) {
        let mut out = self.out.lock();
        let _ = out.write_fmt(args);
        let _ = out.write_all(b"\n");
        let _ = out.flush();
    }
}

impl fmt::Debug for ConsoleReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleReporter")
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

fn seconds(duration: Option<Duration>) -> String {
    duration.map_or_else(String::new, |d| format!(" ({:.1}s)", d.as_secs_f64()))
}

impl ProgressReporter for ConsoleReporter {
    fn start_task(&self, name: &str, total_steps: Option<usize>) {
        match total_steps {
            Some(total) => self.line(format_args!("==> {name} ({total} steps)")),
            None => self.line(format_args!("==> {name}")),
        }
    }

    fn update_step(&self, message: &str, step: Option<usize>, progress: Option<f64>) {
        if !self.verbose {
            return;
        }
        let step = step.map_or_else(String::new, |s| format!("[{s}] "));
        let pct = progress.map_or_else(String::new, |p| {
            format!(" {:.0}%", p.clamp(0.0, 1.0) * 100.0)
        });
        self.line(format_args!("    {step}{message}{pct}"));
    }

    fn complete_step(&self, message: &str, duration: Option<Duration>) {
        self.line(format_args!("    ok {message}{}", seconds(duration)));
    }

    fn complete_task(&self, message: &str, duration: Option<Duration>) {
        self.line(format_args!("<== {message}{}", seconds(duration)));
    }

    fn error(&self, message: &str, detail: Option<&str>) {
        match detail.map(str::trim).filter(|d| !d.is_empty()) {
            Some(detail) => self.line(format_args!("!!  {message}: {detail}")),
            None => self.line(format_args!("!!  {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    #[test]
    fn test_lines() {
        let buf = SharedBuffer::default();
        let reporter = ConsoleReporter::with_writer(Box::new(buf.clone()), true);

        reporter.start_task("transcribe", Some(2));
        reporter.update_step("decoding", Some(1), Some(0.25));
        reporter.complete_task("transcribe done", Some(Duration::from_millis(1500)));
        reporter.error("align failed", Some("exit code 1\n"));

        assert_eq!(
            buf.text(),
            "==> transcribe (2 steps)\n    [1] decoding 25%\n<== transcribe done (1.5s)\n!!  align failed: exit code 1\n"
        );
    }

    #[test]
    fn test_quiet_hides_updates() {
        let buf = SharedBuffer::default();
        let reporter = ConsoleReporter::with_writer(Box::new(buf.clone()), false);

        reporter.update_step("decoding", None, None);
        reporter.complete_step("segment 1", None);

        assert_eq!(buf.text(), "    ok segment 1\n");
    }
}
