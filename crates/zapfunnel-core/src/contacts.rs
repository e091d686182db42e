use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    domain::{InstanceName, Jid},
    errors::Error,
    snapshot::ContactsSnapshot,
    Result,
};

/// One captured contact, recorded under the gateway instance the customer is
/// pinned to so exported lists can be imported per device.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedContact {
    /// Display date, `DD/MM/YYYY`.
    pub date: String,
    pub phone: String,
    pub name: String,
    pub captured_at: DateTime<Utc>,
}

/// Contacts captured at `captureContact` steps, grouped by instance and
/// deduplicated by phone within each instance list.
pub struct ContactBook {
    by_instance: Mutex<HashMap<InstanceName, Vec<CapturedContact>>>,
}

impl Default for ContactBook {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactBook {
    pub fn new() -> Self {
        Self {
            by_instance: Mutex::new(HashMap::new()),
        }
    }

    /// Record a contact. Returns `false` if the phone was already captured
    /// for this instance.
    pub async fn capture(&self, instance: &InstanceName, jid: &Jid, name: &str) -> bool {
        let phone = jid.phone().to_string();
        let mut map = self.by_instance.lock().await;
        let contacts = map.entry(instance.clone()).or_default();

        if contacts.iter().any(|c| c.phone == phone) {
            return false;
        }

        let now = Utc::now();
        contacts.push(CapturedContact {
            date: now.format("%d/%m/%Y").to_string(),
            phone: phone.clone(),
            name: name.to_string(),
            captured_at: now,
        });
        info!(instance = %instance, phone = %phone, "contact captured");
        true
    }

    pub async fn by_instance(
        &self,
        filter: Option<&InstanceName>,
    ) -> HashMap<InstanceName, Vec<CapturedContact>> {
        let map = self.by_instance.lock().await;
        match filter {
            Some(instance) => map
                .get_key_value(instance)
                .map(|(k, v)| HashMap::from([(k.clone(), v.clone())]))
                .unwrap_or_default(),
            None => map.clone(),
        }
    }

    pub async fn total(&self) -> usize {
        self.by_instance.lock().await.values().map(Vec::len).sum()
    }

    pub async fn clear(&self, filter: Option<&InstanceName>) {
        let mut map = self.by_instance.lock().await;
        match filter {
            Some(instance) => {
                map.remove(instance);
            }
            None => map.clear(),
        }
    }

    /// Phone-book import format: `First Name,Mobile Phone`, one row per
    /// distinct phone across all instances, most recent capture first. The
    /// "first name" column carries the capture date, matching how the lists
    /// are consumed downstream.
    pub async fn phonebook_csv(&self) -> Result<String> {
        let map = self.by_instance.lock().await;
        let mut all: Vec<&CapturedContact> = map.values().flatten().collect();
        all.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));

        let mut seen = std::collections::HashSet::new();
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["First Name", "Mobile Phone"])
            .map_err(|e| Error::Csv(e.to_string()))?;
        for contact in all {
            if !seen.insert(contact.phone.clone()) {
                continue;
            }
            writer
                .write_record([contact.date.as_str(), &format!("+{}", contact.phone)])
                .map_err(|e| Error::Csv(e.to_string()))?;
        }
        csv_into_string(writer)
    }

    /// Detailed audit format: date, phone, name, instance, capture timestamp.
    pub async fn detailed_csv(&self) -> Result<String> {
        let map = self.by_instance.lock().await;
        let mut instances: Vec<&InstanceName> = map.keys().collect();
        instances.sort_by(|a, b| a.0.cmp(&b.0));

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["Date", "Phone", "Name", "Instance", "Captured At"])
            .map_err(|e| Error::Csv(e.to_string()))?;
        for instance in instances {
            for contact in &map[instance] {
                writer
                    .write_record([
                        contact.date.as_str(),
                        contact.phone.as_str(),
                        contact.name.as_str(),
                        instance.0.as_str(),
                        &contact.captured_at.to_rfc3339(),
                    ])
                    .map_err(|e| Error::Csv(e.to_string()))?;
            }
        }
        csv_into_string(writer)
    }

    pub async fn snapshot(&self) -> ContactsSnapshot {
        let map = self.by_instance.lock().await;
        ContactsSnapshot {
            by_instance: map
                .iter()
                .map(|(k, v)| (k.0.clone(), v.clone()))
                .collect(),
            last_update: Utc::now(),
        }
    }

    pub async fn restore(&self, snapshot: ContactsSnapshot) {
        let mut map = self.by_instance.lock().await;
        map.clear();
        for (instance, contacts) in snapshot.by_instance {
            map.insert(InstanceName(instance), contacts);
        }
    }
}

fn csv_into_string(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Csv(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::Csv(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(phone: &str) -> Jid {
        Jid(format!("{phone}@s.whatsapp.net"))
    }

    #[tokio::test]
    async fn capture_dedupes_by_phone_within_instance() {
        let book = ContactBook::new();
        let g1 = InstanceName("G01".to_string());
        let g2 = InstanceName("G02".to_string());

        assert!(book.capture(&g1, &jid("5511999990000"), "Ana").await);
        assert!(!book.capture(&g1, &jid("5511999990000"), "Ana B").await);
        // Same phone under another instance is a separate list.
        assert!(book.capture(&g2, &jid("5511999990000"), "Ana").await);

        assert_eq!(book.total().await, 2);
        assert_eq!(book.by_instance(Some(&g1)).await[&g1].len(), 1);
    }

    #[tokio::test]
    async fn phonebook_csv_dedupes_across_instances() {
        let book = ContactBook::new();
        book.capture(&InstanceName("G01".to_string()), &jid("5511999990000"), "Ana")
            .await;
        book.capture(&InstanceName("G02".to_string()), &jid("5511999990000"), "Ana")
            .await;
        book.capture(&InstanceName("G02".to_string()), &jid("5511988887777"), "Bia")
            .await;

        let csv = book.phonebook_csv().await.unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "First Name,Mobile Phone");
        assert_eq!(lines.len(), 3); // header + two distinct phones
        assert!(csv.contains("+5511999990000"));
        assert!(csv.contains("+5511988887777"));
    }

    #[tokio::test]
    async fn detailed_csv_lists_every_capture() {
        let book = ContactBook::new();
        book.capture(&InstanceName("G01".to_string()), &jid("5511999990000"), "Ana")
            .await;
        book.capture(&InstanceName("G02".to_string()), &jid("5511999990000"), "Ana")
            .await;

        let csv = book.detailed_csv().await.unwrap();
        assert_eq!(csv.lines().count(), 3); // header + both rows
        assert!(csv.contains("G01"));
        assert!(csv.contains("G02"));
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let book = ContactBook::new();
        book.capture(&InstanceName("G01".to_string()), &jid("5511999990000"), "Ana")
            .await;

        let restored = ContactBook::new();
        restored.restore(book.snapshot().await).await;
        assert_eq!(restored.total().await, 1);
    }
}
