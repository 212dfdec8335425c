//! Upload coordinator
//!
//! Validates files before any network call, tracks transfers, and turns a
//! finished upload into a reference marker for insertion. Insertion happens
//! only once the transfer is complete; completion order decides insertion
//! order.

use crate::config::SessionConfig;
use crate::error::{UploadError, ValidationError};
use crate::store::InsertPosition;
use crate::types::{AssetRef, FileDescriptor, Revision, TaskId, UploadStatus, UploadTask};
use indexmap::IndexMap;

/// Outcome of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResolution {
    /// Insert `marker` into the buffer
    Insert {
        marker: String,
        position: InsertPosition,
        at_revision: Revision,
    },
    /// Transfer failed; nothing is inserted
    Failed(UploadError),
    /// Unknown or no longer uploading
    Ignored,
}

/// Content marker referencing an uploaded asset
///
/// Images become `<img>` tags, anything else a link.
#[must_use]
pub fn reference_marker(asset: &AssetRef, mime_type: &str) -> String {
    let url = escape_attr(&asset.url);
    if mime_type.to_ascii_lowercase().starts_with("image/") {
        let alt = if asset.name.trim().is_empty() {
            "Uploaded image".to_string()
        } else {
            escape_attr(&asset.name)
        };
        format!(r#"<img src="{url}" alt="{alt}" />"#)
    } else {
        format!(r#"<a href="{url}">{}</a>"#, escape_attr(&asset.name))
    }
}

fn escape_attr(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Bookkeeping for uploads of one session
#[derive(Debug, Clone)]
pub struct UploadCoordinator {
    config: SessionConfig,
    tasks: IndexMap<TaskId, UploadTask>,
}

impl UploadCoordinator {
    /// Create coordinator from session configuration
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            config: config.clone(),
            tasks: IndexMap::new(),
        }
    }

    /// Check a file against the allow-list and size limit
    ///
    /// # Errors
    /// `ValidationError` describing the first violation
    pub fn validate(&self, file: &FileDescriptor) -> Result<(), ValidationError> {
        if !self.config.is_mime_allowed(&file.mime_type) {
            return Err(ValidationError::UnsupportedMimeType(file.mime_type.clone()));
        }
        if file.bytes.is_empty() {
            return Err(ValidationError::EmptyFile(file.name.clone()));
        }
        let max = self.config.max_upload_size_bytes;
        if file.size() > max {
            return Err(ValidationError::TooLarge {
                size: file.size(),
                max,
            });
        }
        Ok(())
    }

    /// Validate and register a file for transfer
    ///
    /// # Errors
    /// `ValidationError` if the file is rejected; no task is created
    pub fn submit(
        &mut self,
        file: &FileDescriptor,
        revision: Revision,
    ) -> Result<TaskId, ValidationError> {
        self.validate(file)?;

        let id = TaskId::new();
        self.tasks.insert(
            id,
            UploadTask {
                id,
                file_name: file.name.clone(),
                mime_type: file.mime_type.clone(),
                size: file.size(),
                anchor: file.anchor,
                submitted_revision: revision,
                status: UploadStatus::Uploading,
                result_ref: None,
                failure: None,
            },
        );
        self.prune();
        Ok(id)
    }

    /// A transfer returned
    pub fn complete(
        &mut self,
        task_id: TaskId,
        result: Result<AssetRef, UploadError>,
    ) -> UploadResolution {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return UploadResolution::Ignored;
        };
        if task.status != UploadStatus::Uploading {
            return UploadResolution::Ignored;
        }

        match result {
            Ok(asset) if asset.url.trim().is_empty() => {
                let error = UploadError::InvalidResponse("empty url".to_string());
                task.status = UploadStatus::Rejected;
                task.failure = Some(error.to_string());
                UploadResolution::Failed(error)
            }
            Ok(asset) => {
                let marker = reference_marker(&asset, &task.mime_type);
                task.status = UploadStatus::Inserting;
                task.result_ref = Some(asset);
                UploadResolution::Insert {
                    marker,
                    position: InsertPosition::from(task.anchor),
                    at_revision: task.submitted_revision,
                }
            }
            Err(error) => {
                task.status = UploadStatus::Rejected;
                task.failure = Some(error.to_string());
                UploadResolution::Failed(error)
            }
        }
    }

    /// Insertion landed
    pub fn mark_done(&mut self, task_id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = UploadStatus::Done;
        }
        self.prune();
    }

    /// Insertion or transfer refused
    pub fn mark_rejected(&mut self, task_id: TaskId, reason: impl Into<String>) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = UploadStatus::Rejected;
            task.failure = Some(reason.into());
        }
        self.prune();
    }

    /// Reject every unfinished task (session closing)
    pub fn cancel_in_flight(&mut self) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for task in self.tasks.values_mut() {
            if !task.status.is_terminal() {
                task.status = UploadStatus::Rejected;
                task.failure = Some(UploadError::Cancelled.to_string());
                cancelled.push(task.id);
            }
        }
        cancelled
    }

    /// Look up a task
    #[inline]
    #[must_use]
    pub fn get(&self, task_id: TaskId) -> Option<&UploadTask> {
        self.tasks.get(&task_id)
    }

    /// Tasks in submission order
    pub fn tasks(&self) -> impl Iterator<Item = &UploadTask> {
        self.tasks.values()
    }

    /// Number of unfinished tasks
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    fn prune(&mut self) {
        while self.tasks.len() > self.config.history_limit {
            let Some(index) = self.tasks.values().position(|t| t.status.is_terminal()) else {
                break;
            };
            self.tasks.shift_remove_index(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> UploadCoordinator {
        UploadCoordinator::new(&SessionConfig::default().with_max_upload_size(1024))
    }

    fn asset(name: &str) -> AssetRef {
        AssetRef {
            url: format!("https://cdn.example/{name}"),
            key: name.to_string(),
            name: name.to_string(),
            size: 10,
        }
    }

    #[test]
    fn validation_rules() {
        let c = coordinator();
        assert!(c
            .validate(&FileDescriptor::new("a.png", "image/png", vec![1u8; 10]))
            .is_ok());
        assert!(c
            .validate(&FileDescriptor::new("a.png", "IMAGE/PNG", vec![1u8; 10]))
            .is_ok());
        assert_eq!(
            c.validate(&FileDescriptor::new("a.exe", "application/x-msdownload", vec![1u8; 10])),
            Err(ValidationError::UnsupportedMimeType(
                "application/x-msdownload".into()
            ))
        );
        assert_eq!(
            c.validate(&FileDescriptor::new("a.png", "image/png", Vec::new())),
            Err(ValidationError::EmptyFile("a.png".into()))
        );
        assert_eq!(
            c.validate(&FileDescriptor::new("a.png", "image/png", vec![0u8; 1025])),
            Err(ValidationError::TooLarge {
                size: 1025,
                max: 1024
            })
        );
    }

    #[test]
    fn rejected_file_creates_no_task() {
        let mut c = coordinator();
        let result = c.submit(&FileDescriptor::new("a.png", "image/png", vec![0u8; 4096]), 0);
        assert!(result.is_err());
        assert_eq!(c.tasks().count(), 0);
    }

    #[test]
    fn completion_produces_marker_at_anchor() {
        let mut c = coordinator();
        let file = FileDescriptor::new("cat.png", "image/png", vec![1u8; 10]).with_anchor(3);
        let id = c.submit(&file, 2).unwrap();
        assert_eq!(c.get(id).unwrap().status, UploadStatus::Uploading);

        let resolution = c.complete(id, Ok(asset("cat.png")));
        assert_eq!(
            resolution,
            UploadResolution::Insert {
                marker: r#"<img src="https://cdn.example/cat.png" alt="cat.png" />"#.into(),
                position: InsertPosition::Offset(3),
                at_revision: 2,
            }
        );
        assert_eq!(c.get(id).unwrap().status, UploadStatus::Inserting);
        c.mark_done(id);
        assert_eq!(c.get(id).unwrap().status, UploadStatus::Done);

        // duplicate completion is ignored
        assert_eq!(c.complete(id, Ok(asset("cat.png"))), UploadResolution::Ignored);
    }

    #[test]
    fn transport_failure_rejects_task() {
        let mut c = coordinator();
        let id = c
            .submit(&FileDescriptor::new("a.gif", "image/gif", vec![1u8; 10]), 0)
            .unwrap();
        let resolution = c.complete(id, Err(UploadError::Transport("reset".into())));
        assert!(matches!(resolution, UploadResolution::Failed(_)));
        let task = c.get(id).unwrap();
        assert_eq!(task.status, UploadStatus::Rejected);
        assert!(task.result_ref.is_none());
    }

    #[test]
    fn markers_escape_attributes() {
        let mut evil = asset("x");
        evil.url = r#"https://cdn.example/a"onerror="x"#.to_string();
        evil.name = "<b>".to_string();
        let marker = reference_marker(&evil, "image/png");
        assert_eq!(
            marker,
            r#"<img src="https://cdn.example/a&quot;onerror=&quot;x" alt="&lt;b&gt;" />"#
        );

        let link = reference_marker(&asset("report.pdf"), "application/pdf");
        assert_eq!(link, r#"<a href="https://cdn.example/report.pdf">report.pdf</a>"#);
    }

    #[test]
    fn cancel_rejects_unfinished_tasks() {
        let mut c = coordinator();
        let id = c
            .submit(&FileDescriptor::new("a.png", "image/png", vec![1u8; 10]), 0)
            .unwrap();
        assert_eq!(c.active_count(), 1);
        assert_eq!(c.cancel_in_flight(), vec![id]);
        assert_eq!(c.active_count(), 0);
        assert_eq!(c.complete(id, Ok(asset("a.png"))), UploadResolution::Ignored);
    }
}
