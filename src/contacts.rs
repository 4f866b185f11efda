//! Emergency contacts, persisted as JSON entries in the settings store.

use std::sync::Arc;

use crate::capabilities::ConfigStore;
use crate::error::{SentinelError, SentinelResult};
use crate::types::EmergencyContact;

/// Store key holding the JSON-encoded contact list.
pub const CONTACTS_KEY: &str = "emergency_contacts";

/// Normalise a phone number to `+` and digits.
///
/// Accepts spaces, dashes, dots and parentheses as separators. Returns None
/// unless 7 to 15 digits remain.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let (plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", trimmed),
    };
    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return None,
        }
    }
    if (7..=15).contains(&digits.len()) {
        Some(format!("{plus}{digits}"))
    } else {
        None
    }
}

/// Contact list backed by a `ConfigStore`.
///
/// Every call reads the store, so edits made by another part of the app are
/// picked up the next time the responder takes its dispatch snapshot.
#[derive(Clone)]
pub struct ContactBook {
    store: Arc<dyn ConfigStore>,
}

impl ContactBook {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    /// All contacts in stored order. Undecodable entries are skipped.
    pub fn all(&self) -> Vec<EmergencyContact> {
        self.store
            .get_string_list(CONTACTS_KEY)
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(contact) => Some(contact),
                Err(e) => {
                    log::warn!("dropping undecodable contact entry: {e}");
                    None
                }
            })
            .collect()
    }

    /// Enabled contacts, primary contacts first.
    pub fn enabled(&self) -> Vec<EmergencyContact> {
        let mut contacts: Vec<_> = self.all().into_iter().filter(|c| c.is_enabled).collect();
        contacts.sort_by_key(|c| !c.is_primary);
        contacts
    }

    pub fn get(&self, id: &str) -> Option<EmergencyContact> {
        self.all().into_iter().find(|c| c.id == id)
    }

    /// Add a contact. The phone number is normalised; ids must be unique.
    pub fn add(&self, mut contact: EmergencyContact) -> SentinelResult<()> {
        contact.phone_number = normalize_phone(&contact.phone_number).ok_or_else(|| {
            SentinelError::Store(format!("invalid phone number for contact {}", contact.id))
        })?;
        let mut contacts = self.all();
        if contacts.iter().any(|c| c.id == contact.id) {
            return Err(SentinelError::Store(format!("duplicate contact id {}", contact.id)));
        }
        if contact.is_primary {
            contacts.iter_mut().for_each(|c| c.is_primary = false);
        }
        contacts.push(contact);
        self.save(&contacts)
    }

    /// Replace the contact with the same id.
    pub fn update(&self, mut contact: EmergencyContact) -> SentinelResult<()> {
        contact.phone_number = normalize_phone(&contact.phone_number).ok_or_else(|| {
            SentinelError::Store(format!("invalid phone number for contact {}", contact.id))
        })?;
        let mut contacts = self.all();
        let slot = contacts
            .iter_mut()
            .find(|c| c.id == contact.id)
            .ok_or_else(|| SentinelError::Store(format!("unknown contact {}", contact.id)))?;
        *slot = contact;
        self.save(&contacts)
    }

    /// Remove a contact. Returns false when it did not exist.
    pub fn remove(&self, id: &str) -> SentinelResult<bool> {
        let mut contacts = self.all();
        let before = contacts.len();
        contacts.retain(|c| c.id != id);
        if contacts.len() == before {
            return Ok(false);
        }
        self.save(&contacts)?;
        Ok(true)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> SentinelResult<()> {
        self.modify(id, |c| c.is_enabled = enabled)
    }

    /// Make `id` the only primary contact.
    pub fn set_primary(&self, id: &str) -> SentinelResult<()> {
        let mut contacts = self.all();
        if !contacts.iter().any(|c| c.id == id) {
            return Err(SentinelError::Store(format!("unknown contact {id}")));
        }
        for c in contacts.iter_mut() {
            c.is_primary = c.id == id;
        }
        self.save(&contacts)
    }

    fn modify(&self, id: &str, apply: impl FnOnce(&mut EmergencyContact)) -> SentinelResult<()> {
        let mut contacts = self.all();
        let contact = contacts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SentinelError::Store(format!("unknown contact {id}")))?;
        apply(contact);
        self.save(&contacts)
    }

    fn save(&self, contacts: &[EmergencyContact]) -> SentinelResult<()> {
        let entries = contacts
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.store.set_string_list(CONTACTS_KEY, &entries)
    }
}
