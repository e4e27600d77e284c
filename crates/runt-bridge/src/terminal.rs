//! Renders output records as plain text on a terminal.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use kernel_bridge::{OutputRecord, OutputSurface};

type Writer = Box<dyn Write + Send>;

struct Streams {
    out: Writer,
    err: Writer,
    /// Bytes of stream text already written, per record index.
    written: HashMap<usize, usize>,
}

/// Writes `text/plain` and stream output to stdout/stderr.
///
/// Merged stream records are reported as replacements; only the new tail
/// is written so the terminal never repeats text.
pub struct TerminalSurface {
    streams: Mutex<Streams>,
}

impl TerminalSurface {
    pub fn stdio() -> Self {
        Self::with_writers(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn with_writers(out: Writer, err: Writer) -> Self {
        Self {
            streams: Mutex::new(Streams {
                out,
                err,
                written: HashMap::new(),
            }),
        }
    }

    fn render(&self, index: usize, record: &OutputRecord) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let Streams { out, err, written } = &mut *streams;
        let _ = match record {
            OutputRecord::Stream { name, text } => {
                let already = written.get(&index).copied().unwrap_or(0);
                let tail = text.get(already..).unwrap_or_default();
                written.insert(index, text.len());
                if name == "stderr" {
                    write!(err, "{}", tail).and_then(|_| err.flush())
                } else {
                    write!(out, "{}", tail).and_then(|_| out.flush())
                }
            }
            OutputRecord::Error {
                ename,
                evalue,
                traceback,
            } => {
                let _ = writeln!(err, "{}: {}", ename, evalue);
                traceback
                    .iter()
                    .try_for_each(|line| writeln!(err, "{}", line))
            }
            OutputRecord::DisplayData { .. } | OutputRecord::ExecuteResult { .. } => {
                match record.plain_text() {
                    Some(text) => writeln!(out, "{}", text),
                    None => Ok(()),
                }
            }
        };
    }
}

impl OutputSurface for TerminalSurface {
    fn cleared(&self) {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .written
            .clear();
    }

    fn appended(&self, index: usize, record: &OutputRecord) {
        self.render(index, record);
    }

    fn replaced(&self, index: usize, record: &OutputRecord) {
        self.render(index, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn surface() -> (TerminalSurface, Buffer, Buffer) {
        let out = Buffer::default();
        let err = Buffer::default();
        let surface = TerminalSurface::with_writers(Box::new(out.clone()), Box::new(err.clone()));
        (surface, out, err)
    }

    fn stream(name: &str, text: &str) -> OutputRecord {
        OutputRecord::Stream {
            name: name.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_merged_stream_writes_only_new_text() {
        let (surface, out, _) = surface();
        surface.appended(0, &stream("stdout", "a"));
        surface.replaced(0, &stream("stdout", "ab"));
        surface.replaced(0, &stream("stdout", "abc"));
        assert_eq!(out.text(), "abc");
    }

    #[test]
    fn test_stderr_and_errors_go_to_err() {
        let (surface, out, err) = surface();
        surface.appended(0, &stream("stderr", "warn\n"));
        surface.appended(
            1,
            &OutputRecord::Error {
                ename: "NameError".into(),
                evalue: "x".into(),
                traceback: vec!["line 1".into()],
            },
        );
        assert_eq!(out.text(), "");
        assert_eq!(err.text(), "warn\nNameError: x\nline 1\n");
    }

    #[test]
    fn test_results_print_plain_text() {
        let (surface, out, _) = surface();
        let mut data = Map::new();
        data.insert("text/plain".into(), json!("2"));
        surface.appended(
            0,
            &OutputRecord::ExecuteResult {
                data,
                metadata: Map::new(),
                execution_count: 1,
            },
        );
        let mut html_only = Map::new();
        html_only.insert("text/html".into(), json!("<b>x</b>"));
        surface.appended(
            1,
            &OutputRecord::DisplayData {
                data: html_only,
                metadata: Map::new(),
                display_id: None,
            },
        );
        assert_eq!(out.text(), "2\n");
    }

    #[test]
    fn test_clear_resets_stream_progress() {
        let (surface, out, _) = surface();
        surface.appended(0, &stream("stdout", "frame 1\n"));
        surface.cleared();
        surface.appended(0, &stream("stdout", "frame 2\n"));
        assert_eq!(out.text(), "frame 1\nframe 2\n");
    }
}
