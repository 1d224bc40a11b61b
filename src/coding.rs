use log::error;
use std::path::{Path, PathBuf};

/// The [`ProgramSource`] is a struct containing WGSL code of a compute kernel
///
/// This struct is not able to read or check WGSL code, it's only purpose is to
/// hold the content of it, evantually manipulate it, and feeding it to a
/// [`crate::pipeline::Pipeline`] build.
///
/// All the code checking is done when the program is built, and never through this stage
/// of the program. On one side this doesn't avoid any wrong code to be loaded, which will be
/// caught only when building, but at the same time it allows to write pseudo code and to
/// manipulate it at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgramSource {
    path: Option<PathBuf>,
    content: String,
}

impl ProgramSource {
    /// This method creates a source from a string literal.
    ///
    /// # Example
    /// ```
    /// use wgpu_pipeline::coding::ProgramSource;
    /// let source = ProgramSource::from_content("
    ///     @group(0) @binding(0)
    ///     var<storage, read_write> Data: array<u32>;
    ///
    ///     @compute @workgroup_size(64)
    ///     fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    ///         Data[id.x] = Data[id.x] + 1u;
    ///     }
    /// ");
    /// assert!(source.path().is_none());
    /// ```
    pub fn from_content(content: &str) -> Self {
        ProgramSource {
            path: None,
            content: content.to_string(),
        }
    }

    /// This function reads a WGSL file into the source content.
    ///
    /// A file which can't be read doesn't make this function fail: the error is logged
    /// and the source is left empty, so that building it reports a compile error.
    ///
    /// # Example
    ///
    /// ```
    /// use wgpu_pipeline::coding::ProgramSource;
    /// let source = ProgramSource::load("./does/not/exist.wgsl");
    /// assert!(source.is_empty());
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                error!("Cannot open shader file {}: {}", path.display(), e);
                String::new()
            }
        };
        ProgramSource {
            path: Some(path.to_path_buf()),
            content,
        }
    }

    /// This function gives back a copy of the source with all the `from` tokens replaced by `to`
    ///
    /// It's useful to create tokens inside a file which are not valid WGSL code, but will
    /// become once tokens are replaced, like a workgroup size only known at run time.
    ///
    /// # Examples
    /// ```
    /// use wgpu_pipeline::coding::ProgramSource;
    /// let source = ProgramSource::from_content("@compute @workgroup_size(€size) fn main() {}");
    /// let sized = source.replace("€size", "256");
    /// assert_eq!(sized.get_content(), "@compute @workgroup_size(256) fn main() {}");
    /// ```
    pub fn replace(&self, from: &str, to: &str) -> Self {
        ProgramSource {
            path: self.path.clone(),
            content: self.content.replace(from, to),
        }
    }

    /// This methods gets the content of the [`ProgramSource`] as a string reference
    pub fn get_content(&self) -> &str {
        &self.content
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

#[cfg(test)]
mod coding_tests {
    use super::*;

    #[test]
    fn load_reads_the_whole_file() {
        let path = std::env::temp_dir().join("wgpu_pipeline_load_test.wgsl");
        std::fs::write(&path, "fn f() {}\n").unwrap();

        let source = ProgramSource::load(&path);
        assert_eq!(source.get_content(), "fn f() {}\n");
        assert_eq!(source.path(), Some(path.as_path()));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn unreadable_file_gives_an_empty_source() {
        let source = ProgramSource::load("./no_such_dir/kernel.wgsl");
        assert!(source.is_empty());
        assert!(source.path().is_some());
    }

    #[test]
    fn replace_keeps_the_original_untouched() {
        let source = ProgramSource::from_content("array<u32, €n>");
        let replaced = source.replace("€n", "16");
        assert_eq!(replaced.get_content(), "array<u32, 16>");
        assert_eq!(source.get_content(), "array<u32, €n>");
    }
}
