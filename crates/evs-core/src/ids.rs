use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(TaskRef);
id_newtype!(Window);
id_newtype!(BatchId);
id_newtype!(RemoteSubmissionId);
id_newtype!(FileHandle);
id_newtype!(LocalSubmissionId);
id_newtype!(LeaseId);

impl BatchId {
    /// Timestamp-derived id, e.g. `batch-20251022-143052-1a2b3c4d`.
    /// The random suffix keeps ids unique when two batches start in the same second.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("batch-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8]))
    }
}

impl LocalSubmissionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl LeaseId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

/// Key of the per-(task, window) record. One active submission exists per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskWindow {
    pub task_ref: TaskRef,
    pub window: Window,
}

impl TaskWindow {
    pub fn new(task_ref: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            task_ref: TaskRef::new(task_ref),
            window: Window::new(window),
        }
    }
}

impl fmt::Display for TaskWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.task_ref, self.window)
    }
}
