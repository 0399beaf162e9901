#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use multiomics_runner::reference::ReferenceError;
use multiomics_runner::{
    CommandError, CommandExecutor, CommandOutput, ExternalCommand, MemoryStore, ReferenceResolver,
    SyncRunner,
};

/// Executor that records every command, fails the ones matching a pattern a
/// fixed number of times, and writes files for `cp`s of known sources.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<ExternalCommand>>,
    failures: Mutex<Vec<(String, u32)>>,
    objects: HashMap<String, String>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` commands whose rendered line contains `needle`.
    pub fn fail_matching(self, needle: &str, times: u32) -> Self {
        self.failures
            .lock()
            .expect("failures lock")
            .push((needle.to_string(), times));
        self
    }

    /// Make `cp <uri> <dest>` write `contents` to `dest`.
    pub fn with_object(mut self, uri: &str, contents: &str) -> Self {
        self.objects.insert(uri.to_string(), contents.to_string());
        self
    }

    /// Rendered command lines in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn commands(&self) -> Vec<ExternalCommand> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    fn should_fail(&self, line: &str) -> bool {
        let mut failures = self.failures.lock().expect("failures lock");
        for (needle, remaining) in failures.iter_mut() {
            if *remaining > 0 && line.contains(needle.as_str()) {
                *remaining -= 1;
                return true;
            }
        }
        false
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(&self, command: &ExternalCommand) -> Result<CommandOutput, CommandError> {
        let line = command.to_string();
        self.calls.lock().expect("calls lock").push(command.clone());
        if self.should_fail(&line) {
            return Ok(CommandOutput {
                code: Some(1),
                lines: vec![format!("simulated failure: {line}")],
            });
        }

        if let [_, verb, source, destination] = command.arguments() {
            if verb == "cp" {
                if let Some(contents) = self.objects.get(source) {
                    fs::write(destination, contents).expect("write staged object");
                }
            }
        }

        Ok(CommandOutput {
            code: Some(0),
            lines: Vec::new(),
        })
    }
}

/// Resolver that creates `<genome_dir>/<name>` without touching the network.
#[derive(Debug)]
pub struct LocalResolver {
    name: String,
    calls: AtomicUsize,
}

impl LocalResolver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReferenceResolver for LocalResolver {
    fn resolve<E: CommandExecutor>(
        &self,
        _taxon: &str,
        genome_dir: &Path,
        _runner: &SyncRunner<E>,
    ) -> Result<PathBuf, ReferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = genome_dir.join(&self.name);
        fs::create_dir_all(&path).map_err(|source| ReferenceError::Io {
            operation: "create reference",
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// Store with `count` objects named `<prefix><index:04>` in `bucket`.
pub fn seeded_store(bucket: &str, prefix: &str, count: usize) -> MemoryStore {
    let store = MemoryStore::with_page_size(7);
    for key in numbered_keys(prefix, count) {
        store.put(bucket, &key, key.as_bytes());
    }
    store
}

pub fn numbered_keys(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|idx| format!("{prefix}{idx:04}")).collect()
}

pub fn md5_hex(value: &str) -> String {
    format!("{:x}", md5::compute(value.as_bytes()))
}
