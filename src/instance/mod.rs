
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Result;

const TRACING_DIRS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

fn accessible(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_encoded_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::F_OK) == 0 }
}

/// Locate the mounted tracing directory.
pub fn tracing_dir() -> Result<PathBuf> {
    TRACING_DIRS
        .iter()
        .map(PathBuf::from)
        .find(|path| accessible(path))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "tracefs is not mounted").into())
}

/// A tracing instance: the top-level tracing directory, or a named
/// buffer under `instances/`.
///
/// Trigger files are resolved under the instance, while global control
/// files such as `synthetic_events` always resolve under the top-level
/// tracing directory, whichever instance is used.
#[derive(Clone, Debug)]
pub struct Instance {
    tracing: PathBuf,
    dir: PathBuf,
}

impl Instance {
    /// The top-level tracing directory.
    pub fn top() -> Result<Self> {
        let dir = tracing_dir()?;
        Ok(Self {
            tracing: dir.clone(),
            dir,
        })
    }

    /// The instance under `instances/<name>`, created if missing.
    pub fn named(name: &str) -> Result<Self> {
        let tracing = tracing_dir()?;
        let dir = tracing.join("instances").join(name);
        if !dir.is_dir() {
            fs::create_dir(&dir)?;
        }
        Ok(Self { tracing, dir })
    }

    /// Treat an arbitrary directory as both the tracing directory and
    /// the instance. Meant for tests and unusual mounts.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            tracing: dir.clone(),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tracing_dir(&self) -> &Path {
        &self.tracing
    }

    /// Path of `events/<system>/<event>/<leaf>` under this instance.
    pub fn event_file(&self, system: &str, event: &str, leaf: &str) -> PathBuf {
        self.dir.join("events").join(system).join(event).join(leaf)
    }

    pub fn event_file_exists(&self, system: &str, event: &str, leaf: &str) -> bool {
        self.event_file(system, event, leaf).is_file()
    }

    pub fn append_event_file(
        &self,
        system: &str,
        event: &str,
        leaf: &str,
        content: &str,
    ) -> Result<()> {
        append(&self.event_file(system, event, leaf), content)
    }

    /// Append to a control file directly under the instance directory.
    pub fn append_file(&self, name: &str, content: &str) -> Result<()> {
        append(&self.dir.join(name), content)
    }

    /// Append to a control file under the top-level tracing directory.
    /// `synthetic_events` lives there regardless of instance.
    pub fn append_tracing_file(&self, name: &str, content: &str) -> Result<()> {
        append(&self.tracing.join(name), content)
    }

    pub fn enable_event(&self, system: &str, event: &str) -> Result<()> {
        self.set_event_enable(system, event, "1")
    }

    pub fn disable_event(&self, system: &str, event: &str) -> Result<()> {
        self.set_event_enable(system, event, "0")
    }

    // The enable file must already exist, like any tracefs control file.
    fn set_event_enable(&self, system: &str, event: &str, flag: &str) -> Result<()> {
        let path = self.event_file(system, event, "enable");
        debug!("writing '{flag}' to {}", path.display());
        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(flag.as_bytes())?;
        Ok(())
    }
}

fn append(path: &Path, content: &str) -> Result<()> {
    debug!("appending '{}' to {}", content.trim_end(), path.display());
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
