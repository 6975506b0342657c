use std::path::{Path, PathBuf};

/// Fixed file layout of a session's working directory.
///
/// The engine runs with this directory as its current directory, so the
/// names here are also what the engines see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fuzzer(&self) -> PathBuf {
        self.root.join("fuzzer")
    }

    pub fn fuzzer_zip(&self) -> PathBuf {
        self.root.join("fuzzer.zip")
    }

    pub fn fuzzer_jar(&self) -> PathBuf {
        self.root.join("fuzzer.jar")
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join("corpus")
    }

    pub fn seed_dir(&self) -> PathBuf {
        self.root.join("seed")
    }

    pub fn additional_corpus_dir(&self) -> PathBuf {
        self.root.join("additional-corpus")
    }

    pub fn merge_dir(&self) -> PathBuf {
        self.root.join("merge")
    }

    pub fn merge_control_file(&self) -> PathBuf {
        self.root.join("merge_control.txt")
    }

    /// Where the engine writes its crash reproducer.
    pub fn artifact(&self) -> PathBuf {
        self.root.join("artifact")
    }

    pub fn go_workdir(&self) -> PathBuf {
        self.root.join("workdir")
    }

    pub fn go_corpus_dir(&self) -> PathBuf {
        self.go_workdir().join("corpus")
    }

    pub fn go_crashers_dir(&self) -> PathBuf {
        self.go_workdir().join("crashers")
    }
}
