// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent scalar state.
//!
//! Named values (startup-time control settings, tunables) mirror their
//! in-memory variables through [`Persistent`] handles registered with a
//! [`StateStore`]. The store writes one `name=value` line per entry,
//! through a temporary sibling file renamed over the live file on
//! success. A background poller writes only when something actually
//! changed since the last write, sparing the flash the state file usually
//! lives on.

use crate::runtime::Shutdown;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default period between change polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1000);

/// A value that can live in the state file.
pub trait StateValue: Clone + PartialEq + Send + 'static {
    fn write(&self, out: &mut String);
    /// Parse `text` into self. Returns false (leaving self untouched) on
    /// malformed input.
    fn parse_into(&mut self, text: &str) -> bool;
}

impl StateValue for i32 {
    fn write(&self, out: &mut String) {
        out.push_str(&self.to_string());
    }

    fn parse_into(&mut self, text: &str) -> bool {
        match text.parse() {
            Ok(value) => {
                *self = value;
                true
            }
            Err(_) => false,
        }
    }
}

impl StateValue for bool {
    fn write(&self, out: &mut String) {
        out.push_str(if *self { "yes" } else { "no" });
    }

    fn parse_into(&mut self, text: &str) -> bool {
        match text {
            "yes" => *self = true,
            "no" => *self = false,
            _ => return false,
        }
        true
    }
}

/// Fixed-length integer waveform. A stored line of the wrong length is
/// rejected rather than resizing the value.
impl StateValue for Vec<i32> {
    fn write(&self, out: &mut String) {
        for value in self {
            out.push(' ');
            out.push_str(&value.to_string());
        }
    }

    fn parse_into(&mut self, text: &str) -> bool {
        let mut parsed = Vec::with_capacity(self.len());
        for token in text.split_whitespace() {
            match token.parse() {
                Ok(value) => parsed.push(value),
                Err(_) => return false,
            }
        }
        if parsed.len() != self.len() {
            return false;
        }
        *self = parsed;
        true
    }
}

struct Slot<T> {
    value: T,
    saved: T,
}

/// Handle to one persistent value.
#[derive(Clone)]
pub struct Persistent<T: StateValue> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T: StateValue> Persistent<T> {
    pub fn get(&self) -> T {
        self.slot.lock().value.clone()
    }

    pub fn set(&self, value: T) {
        self.slot.lock().value = value;
    }
}

trait StateEntry: Send {
    fn name(&self) -> &str;
    fn changed(&self) -> bool;
    fn write(&self, out: &mut String);
    fn parse(&self, text: &str) -> bool;
    fn backup(&self);
}

struct Entry<T: StateValue> {
    name: String,
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T: StateValue> StateEntry for Entry<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn changed(&self) -> bool {
        let slot = self.slot.lock();
        slot.value != slot.saved
    }

    fn write(&self, out: &mut String) {
        self.slot.lock().value.write(out);
    }

    fn parse(&self, text: &str) -> bool {
        let mut slot = self.slot.lock();
        if slot.value.parse_into(text) {
            slot.saved = slot.value.clone();
            true
        } else {
            false
        }
    }

    fn backup(&self) {
        let mut slot = self.slot.lock();
        slot.saved = slot.value.clone();
    }
}

struct StoreInner {
    path: PathBuf,
    remount: Option<PathBuf>,
    entries: Vec<Box<dyn StateEntry>>,
}

/// The state file and its registered values.
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, remount: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                path: path.into(),
                remount,
                entries: Vec::new(),
            }),
        })
    }

    /// Register a named value, initialising it from the state file when a
    /// well-formed entry exists there.
    pub fn register<T: StateValue>(&self, name: &str, default: T) -> Persistent<T> {
        let slot = Arc::new(Mutex::new(Slot {
            value: default.clone(),
            saved: default,
        }));
        let entry = Entry {
            name: name.to_string(),
            slot: Arc::clone(&slot),
        };

        let mut inner = self.inner.lock();
        // Scanning the whole file per variable is inefficient but there
        // are very few variables to read.
        if let Ok(contents) = fs::read_to_string(&inner.path) {
            for line in contents.lines() {
                if let Some(text) = line.strip_prefix(name).and_then(|l| l.strip_prefix('=')) {
                    if !entry.parse(text) {
                        log::warn!(
                            "malformed entry \"{}\" in state file \"{}\"",
                            line,
                            inner.path.display()
                        );
                    }
                    break;
                }
            }
        }
        debug_assert!(
            inner.entries.iter().all(|e| e.name() != name),
            "duplicate persistent value {}",
            name
        );
        inner.entries.push(Box::new(entry));
        Persistent { slot }
    }

    /// Whether any registered value differs from its last written state.
    pub fn changed(&self) -> bool {
        self.inner.lock().entries.iter().any(|e| e.changed())
    }

    /// Write the state file unconditionally.
    pub fn write_now(&self) -> io::Result<()> {
        let inner = self.inner.lock();
        let mut contents = format!(
            "# Written: {}\n",
            chrono::Local::now().format("%a %b %e %T %Y")
        );
        for entry in &inner.entries {
            contents.push_str(entry.name());
            contents.push('=');
            entry.write(&mut contents);
            contents.push('\n');
            entry.backup();
        }

        remount(&inner.remount, true);
        let mut backup = inner.path.as_os_str().to_owned();
        backup.push(".backup");
        let backup = PathBuf::from(backup);
        let result = fs::write(&backup, &contents).and_then(|()| fs::rename(&backup, &inner.path));
        remount(&inner.remount, false);
        if let Err(e) = &result {
            log::error!("writing persistent state failed: {}", e);
        }
        result
    }

    /// Start the background poller: every `period`, write the file if
    /// anything changed; write one final time on shutdown.
    pub fn spawn_poller(
        self: &Arc<Self>,
        period: Duration,
        shutdown: Arc<Shutdown>,
    ) -> io::Result<JoinHandle<()>> {
        let store = Arc::clone(self);
        std::thread::Builder::new()
            .name("state-poller".into())
            .spawn(move || loop {
                let stopping = shutdown.wait_timeout(period);
                if store.changed() {
                    let _ = store.write_now();
                }
                if stopping {
                    break;
                }
            })
    }
}

fn remount(mount: &Option<PathBuf>, writable: bool) {
    let Some(mount) = mount else { return };
    let option = if writable { "remount,rw" } else { "remount,ro" };
    match std::process::Command::new("mount")
        .arg("-o")
        .arg(option)
        .arg(mount)
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => log::error!("mount -o {} {} failed: {}", option, mount.display(), status),
        Err(e) => log::error!("mount -o {} {} failed: {}", option, mount.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        {
            let store = StateStore::new(&path, None);
            let offset = store.register("mc_offset", 0i32);
            let enabled = store.register("enabled", false);
            let wave = store.register("taps", vec![0i32; 3]);
            offset.set(-1234);
            enabled.set(true);
            wave.set(vec![1, 2, 3]);
            assert!(store.changed());
            store.write_now().unwrap();
            assert!(!store.changed());
        }
        let store = StateStore::new(&path, None);
        assert_eq!(store.register("mc_offset", 0i32).get(), -1234);
        assert!(store.register("enabled", false).get());
        assert_eq!(store.register("taps", vec![0i32; 3]).get(), vec![1, 2, 3]);
        // Freshly loaded values are not dirty.
        assert!(!store.changed());
    }

    #[test]
    fn unknown_and_malformed_entries_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, "# Written: sometime\nbroken=abc\nshort_wave= 1 2\n").unwrap();
        let store = StateStore::new(&path, None);
        assert_eq!(store.register("missing", 7i32).get(), 7);
        assert_eq!(store.register("broken", 3i32).get(), 3);
        // Wrong waveform length is rejected.
        assert_eq!(
            store.register("short_wave", vec![9i32; 3]).get(),
            vec![9, 9, 9]
        );
    }

    #[test]
    fn write_leaves_no_temporary_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let store = StateStore::new(&path, None);
        let value = store.register("x", 1i32);
        value.set(2);
        store.write_now().unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state")]);
    }

    #[test]
    fn poller_writes_on_change_and_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let store = StateStore::new(&path, None);
        let value = store.register("poll_me", 0i32);
        let shutdown = Arc::new(Shutdown::new());
        let handle = store
            .spawn_poller(Duration::from_millis(10), Arc::clone(&shutdown))
            .unwrap();

        value.set(5);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(path.exists(), "poller never wrote the file");

        // A change just before shutdown still reaches the file.
        value.set(6);
        shutdown.request();
        handle.join().unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("poll_me=6"), "{}", contents);
    }
}
