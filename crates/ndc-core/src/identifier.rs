use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{HistoryError, Result};

/// Identity of one workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowIdentifier {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowIdentifier {
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Reject identifiers with empty components.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`] naming the first empty field.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("domain_id", &self.domain_id),
            ("workflow_id", &self.workflow_id),
            ("run_id", &self.run_id),
        ] {
            if value.trim().is_empty() {
                return Err(HistoryError::invalid(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}

impl fmt::Display for WorkflowIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}
