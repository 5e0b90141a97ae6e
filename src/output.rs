//! Persisting RPC output and configuration diffs to local files.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Destination options for saved output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputOptions {
    /// Single file receiving every output of the run.
    pub dest: Option<PathBuf>,
    /// Directory receiving one file per output.
    pub dest_dir: Option<PathBuf>,
    /// File receiving the configuration diff.
    pub diffs_file: Option<PathBuf>,
}

/// Writes outputs for one host according to [`OutputOptions`].
#[derive(Debug, Clone)]
pub struct OutputSink {
    host: String,
    options: OutputOptions,
    dest_started: bool,
}

impl OutputSink {
    pub fn new(host: impl Into<String>, options: OutputOptions) -> Self {
        Self {
            host: host.into(),
            options,
            dest_started: false,
        }
    }

    pub fn options(&self) -> &OutputOptions {
        &self.options
    }

    /// Path the next output named `name` would be written to, and whether
    /// it is appended.
    fn target(&mut self, name: &str, format: &str) -> Option<(PathBuf, bool)> {
        if name == "diff" {
            if let Some(file) = &self.options.diffs_file {
                return Some((file.clone(), false));
            }
            return self
                .options
                .dest_dir
                .as_ref()
                .map(|dir| (dir.join(format!("{}.diff", self.host)), false));
        }

        if let Some(dest) = &self.options.dest {
            let append = self.dest_started;
            self.dest_started = true;
            return Some((dest.clone(), append));
        }

        self.options.dest_dir.as_ref().map(|dir| {
            let name = name.replace([' ', '|'], "_");
            let suffix = if name == "config" {
                String::new()
            } else {
                format!("_{name}")
            };
            (dir.join(format!("{}{suffix}.{format}", self.host)), false)
        })
    }

    /// Save `text` produced by the output called `name` in `format`.
    ///
    /// Returns the written path, or `None` when no destination is configured.
    pub fn save(
        &mut self,
        name: &str,
        format: &str,
        text: &str,
    ) -> Result<Option<PathBuf>, DeviceError> {
        let Some((path, append)) = self.target(name, format) else {
            return Ok(None);
        };
        write_file(&path, append, text)?;
        debug!("[{}] Output saved to: {}.", self.host, path.display());
        Ok(Some(path))
    }

    /// Save a configuration diff.
    pub fn save_diff(&mut self, diff: &str) -> Result<Option<PathBuf>, DeviceError> {
        self.save("diff", "diff", diff)
    }
}

fn write_file(path: &Path, append: bool, text: &str) -> Result<(), DeviceError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .and_then(|mut f| f.write_all(text.as_bytes()).map(|_| f))
        .map_err(|_| {
            DeviceError::Validation(format!(
                "Unable to save output. Failed to open the {} file.",
                path.display()
            ))
        })?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn dest_truncates_first_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        fs::write(&dest, "stale").unwrap();
        let mut sink = OutputSink::new(
            "r1",
            OutputOptions {
                dest: Some(dest.clone()),
                ..Default::default()
            },
        );
        sink.save("get-software-information", "text", "one\n").unwrap();
        sink.save("get-chassis-inventory", "text", "two\n").unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn dest_dir_names_files_per_host_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = OutputSink::new(
            "r1",
            OutputOptions {
                dest_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        );
        let path = sink
            .save("show interfaces | match ge", "text", "x")
            .unwrap()
            .unwrap();
        assert_eq!(path, dir.path().join("r1_show_interfaces___match_ge.text"));
        let path = sink.save("config", "xml", "<c/>").unwrap().unwrap();
        assert_eq!(path, dir.path().join("r1.xml"));
        let path = sink.save_diff("[edit]").unwrap().unwrap();
        assert_eq!(path, dir.path().join("r1.diff"));
    }

    #[test]
    fn diffs_file_overrides_dest_dir() {
        let dir = tempfile::tempdir().unwrap();
        let diffs = dir.path().join("changes.diff");
        let mut sink = OutputSink::new(
            "r1",
            OutputOptions {
                dest_dir: Some(dir.path().to_path_buf()),
                diffs_file: Some(diffs.clone()),
                ..Default::default()
            },
        );
        assert_eq!(sink.save_diff("+ x").unwrap(), Some(diffs.clone()));
        assert_eq!(fs::read_to_string(diffs).unwrap(), "+ x");
    }

    #[test]
    fn no_destination_is_a_no_op() {
        let mut sink = OutputSink::new("r1", OutputOptions::default());
        assert_eq!(sink.save("config", "text", "x").unwrap(), None);
    }
}
