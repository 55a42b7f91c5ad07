//! Contact directory seam: resolves a campaign's audience to concrete
//! contacts with subscription status.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::model::{Audience, Contact, ContactId};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("audience resolution failed: {0}")]
    Resolution(String),
}

/// Resolves audiences and looks up individual contacts.
///
/// The sequencer treats the resolved set as fixed for one pass; contacts
/// matching a filter later are picked up on the next poll.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn resolve(&self, audience: &Audience) -> Result<Vec<Contact>, DirectoryError>;

    async fn contact(&self, id: ContactId) -> Result<Option<Contact>, DirectoryError>;
}

/// Fixed in-memory directory used by the standalone daemon and tests.
///
/// Filter audiences match on simple field/value equality over the contact's
/// substitution variables.
#[derive(Default)]
pub struct StaticDirectory {
    contacts: Vec<Contact>,
}

impl StaticDirectory {
    pub fn new(contacts: Vec<Contact>) -> Self {
        Self { contacts }
    }
}

#[async_trait]
impl ContactDirectory for StaticDirectory {
    async fn resolve(&self, audience: &Audience) -> Result<Vec<Contact>, DirectoryError> {
        let resolved: Vec<Contact> = match audience {
            Audience::Contacts { contact_ids } => self
                .contacts
                .iter()
                .filter(|c| contact_ids.contains(&c.id))
                .cloned()
                .collect(),
            Audience::Filters { filters } => {
                let object = filters.as_object().ok_or_else(|| {
                    DirectoryError::Resolution("filters must be a JSON object".to_string())
                })?;
                self.contacts
                    .iter()
                    .filter(|c| {
                        let vars = c.variables();
                        object.iter().all(|(field, expected)| {
                            expected
                                .as_str()
                                .is_some_and(|e| vars.get(field).is_some_and(|v| v == e))
                        })
                    })
                    .cloned()
                    .collect()
            }
        };

        debug!(resolved = resolved.len(), "audience_resolved");
        Ok(resolved)
    }

    async fn contact(&self, id: ContactId) -> Result<Option<Contact>, DirectoryError> {
        Ok(self.contacts.iter().find(|c| c.id == id).cloned())
    }
}
