use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use log::debug;

/// How the supervisor asks whether the host has seen user input recently.
/// Drives the reconnect-delay tier, nothing else.
pub trait ActivityProbe {
    fn recently_active(&self, within: Duration) -> bool;
}

/// Judges activity by the newest modification time under the configured
/// input nodes (files or directories of event nodes). When nothing can be
/// read the host is assumed active, which keeps reconnects on the short
/// delay.
pub struct FileActivityProbe {
    nodes: Vec<PathBuf>,
}

impl FileActivityProbe {
    pub fn new(nodes: Vec<PathBuf>) -> Self {
        FileActivityProbe { nodes }
    }

    fn newest_mtime(&self) -> Option<SystemTime> {
        let mut newest: Option<SystemTime> = None;

        for node in &self.nodes {
            let mut consider = |mtime: SystemTime| {
                if newest.map_or(true, |current| mtime > current) {
                    newest = Some(mtime);
                }
            };

            match std::fs::metadata(node) {
                Ok(meta) if meta.is_dir() => {
                    let entries = match std::fs::read_dir(node) {
                        Ok(entries) => entries,
                        Err(err) => {
                            debug!("Cannot read activity node {}: {}", node.display(), err);
                            continue;
                        },
                    };
                    for entry in entries.flatten() {
                        if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
                            consider(mtime);
                        }
                    }
                },
                Ok(meta) => {
                    if let Ok(mtime) = meta.modified() {
                        consider(mtime);
                    }
                },
                Err(err) => {
                    debug!("Cannot stat activity node {}: {}", node.display(), err);
                },
            }
        }

        newest
    }
}

impl ActivityProbe for FileActivityProbe {
    fn recently_active(&self, within: Duration) -> bool {
        match self.newest_mtime() {
            Some(mtime) => match mtime.elapsed() {
                Ok(age) => age < within,
                Err(_) => true, // clock skew; assume active
            },
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_file_counts_as_active() {
        let dir = TempDir::new().unwrap();
        let node = dir.path().join("event0");
        std::fs::write(&node, b"").unwrap();

        let probe = FileActivityProbe::new(vec![node]);
        assert!(probe.recently_active(Duration::from_secs(60)));
    }

    #[test]
    fn scans_directories_for_newest_entry() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("event0"), b"").unwrap();

        let probe = FileActivityProbe::new(vec![dir.path().to_path_buf()]);
        assert!(probe.recently_active(Duration::from_secs(60)));
        assert!(!probe.recently_active(Duration::from_secs(0)));
    }

    #[test]
    fn unreadable_nodes_default_to_active() {
        let probe = FileActivityProbe::new(vec![PathBuf::from("/nonexistent/event0")]);
        assert!(probe.recently_active(Duration::from_secs(1)));
    }
}
