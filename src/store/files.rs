//! On-disk locations of uploaded submission files.

use std::path::{Component, Path, PathBuf};

use super::{Submission, SubmissionFile};
use crate::error::{Error, Result};

/// Uploaded files live at `root/<course>/<assignment>/<submission>/<filename>`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one submission's files.
    pub fn submission_dir(&self, submission: &Submission) -> PathBuf {
        self.root
            .join(submission.course_id.to_string())
            .join(submission.assignment_id.to_string())
            .join(submission.id.to_string())
    }

    /// Path of a stored file. Rejects names that are not a single plain
    /// path component.
    pub fn path(&self, submission: &Submission, file: &SubmissionFile) -> Result<PathBuf> {
        if !is_plain_file_name(&file.filename) {
            return Err(Error::InvalidRecord(format!(
                "submission file {} has unsafe name {:?}",
                file.id, file.filename
            )));
        }
        Ok(self.submission_dir(submission).join(&file.filename))
    }
}

/// True if `name` is exactly one normal path component (no `/`, `..`, `.`).
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::timestamp;

    fn submission() -> Submission {
        Submission {
            id: 30,
            user_id: 1,
            question_id: 4,
            assignment_id: 20,
            course_id: 10,
            timestamp: timestamp(0),
            disabled: false,
        }
    }

    fn file(filename: &str) -> SubmissionFile {
        SubmissionFile {
            id: 1,
            submission_id: 30,
            filename: filename.to_string(),
        }
    }

    #[test]
    fn path_is_course_assignment_submission_filename() {
        let store = FileStore::new("/srv/submissions");
        assert_eq!(
            store.path(&submission(), &file("main.py")).unwrap(),
            PathBuf::from("/srv/submissions/10/20/30/main.py")
        );
    }

    #[test]
    fn traversal_is_rejected() {
        let store = FileStore::new("/srv/submissions");
        assert!(store.path(&submission(), &file("../31/main.py")).is_err());
        assert!(store.path(&submission(), &file("..")).is_err());
        assert!(store.path(&submission(), &file("/etc/passwd")).is_err());
        assert!(store.path(&submission(), &file("")).is_err());
    }

    #[test]
    fn plain_names() {
        assert!(is_plain_file_name("main.py"));
        assert!(is_plain_file_name(".hidden"));
        assert!(!is_plain_file_name("a/b"));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name("dir/"));
    }
}
