//! Recipient Resolver — turns an audience spec into the deliverable
//! recipients of an event, evaluated at dispatch time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use unveil_core::error::{Result, UnveilError};
use unveil_core::traits::RecipientStore;
use unveil_core::types::{AudienceSpec, DeviceToken, GuestRecord, GuestRole, Recipient};

pub struct RecipientResolver {
    store: Arc<dyn RecipientStore>,
}

/// Whether a candidate row really belongs to the audience.
///
/// Hosts are only reached when named explicitly.
fn matches_audience(guest: &GuestRecord, spec: &AudienceSpec) -> bool {
    if guest.removed_at.is_some() {
        return false;
    }
    match spec {
        AudienceSpec::All => guest.role != GuestRole::Host,
        AudienceSpec::ByStatus(statuses) => {
            guest.role != GuestRole::Host && statuses.contains(&guest.rsvp_status)
        }
        AudienceSpec::ByTags(tags) => {
            guest.role != GuestRole::Host && guest.tags.iter().any(|t| tags.contains(t))
        }
        AudienceSpec::ByIds(ids) => ids.contains(&guest.id),
    }
}

impl RecipientResolver {
    pub fn new(store: Arc<dyn RecipientStore>) -> Self {
        Self { store }
    }

    /// Resolve `spec` against the current state of `event_id`.
    ///
    /// Output is deduplicated by guest id in first-seen order, excludes
    /// opted-out guests and guests with neither a phone number nor an active
    /// device token. Store failures surface as [`UnveilError::Resolution`].
    pub async fn resolve(&self, spec: &AudienceSpec, event_id: &str) -> Result<Vec<Recipient>> {
        let candidates = self
            .store
            .list_guests(event_id, spec)
            .await
            .map_err(|e| UnveilError::Resolution(format!("guest query for event {event_id}: {e}")))?;

        let mut seen = HashSet::new();
        let guests: Vec<GuestRecord> = candidates
            .into_iter()
            .filter(|g| g.event_id == event_id && matches_audience(g, spec) && !g.opted_out)
            .filter(|g| seen.insert(g.id.clone()))
            .collect();

        if guests.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = guests.iter().map(|g| g.id.clone()).collect();
        let tokens = self
            .store
            .list_active_device_tokens(&ids)
            .await
            .map_err(|e| UnveilError::Resolution(format!("device token query: {e}")))?;
        let mut by_guest = group_tokens(tokens);

        let total = guests.len();
        let recipients: Vec<Recipient> = guests
            .into_iter()
            .map(|g| Recipient {
                device_tokens: by_guest.remove(&g.id).unwrap_or_default(),
                phone_number: g.phone_number.filter(|p| !p.trim().is_empty()),
                sms_opt_out: g.sms_opt_out,
                guest_id: g.id,
            })
            .filter(|r| r.has_push() || r.phone_number.is_some())
            .collect();

        tracing::debug!(
            "🎯 Resolved {} recipient(s) for event {event_id} ({} candidate(s) after filtering, audience {})",
            recipients.len(),
            total,
            spec.kind()
        );
        Ok(recipients)
    }
}

/// Active tokens per guest, first-seen order, duplicate tokens dropped.
fn group_tokens(tokens: Vec<DeviceToken>) -> HashMap<String, Vec<DeviceToken>> {
    let mut grouped: HashMap<String, Vec<DeviceToken>> = HashMap::new();
    for token in tokens.into_iter().filter(|t| t.is_active) {
        let list = grouped.entry(token.guest_id.clone()).or_default();
        if !list.iter().any(|t| t.token == token.token) {
            list.push(token);
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SchedulerDb;
    use async_trait::async_trait;
    use unveil_core::types::{Platform, RsvpStatus};

    fn guest(id: &str, rsvp: RsvpStatus, tags: &[&str], phone: Option<&str>) -> GuestRecord {
        GuestRecord {
            id: id.into(),
            event_id: "evt-1".into(),
            display_name: id.into(),
            role: GuestRole::Guest,
            rsvp_status: rsvp,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            opted_out: false,
            sms_opt_out: false,
            phone_number: phone.map(str::to_string),
            removed_at: None,
        }
    }

    fn token(guest_id: &str, token: &str) -> DeviceToken {
        DeviceToken {
            guest_id: guest_id.into(),
            token: token.into(),
            platform: Platform::Android,
            is_active: true,
        }
    }

    fn seeded() -> Arc<SchedulerDb> {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.upsert_guest(&guest("alice", RsvpStatus::Pending, &["vip", "family"], Some("+15550000001")))
            .unwrap();
        db.upsert_guest(&guest("bob", RsvpStatus::Pending, &["family"], None)).unwrap();
        db.upsert_guest(&guest("cara", RsvpStatus::Pending, &[], Some("+15550000003")))
            .unwrap();
        db.upsert_guest(&guest("dan", RsvpStatus::Attending, &["vip"], Some("+15550000004")))
            .unwrap();
        let mut opted = guest("erin", RsvpStatus::Pending, &["vip"], Some("+15550000005"));
        opted.opted_out = true;
        db.upsert_guest(&opted).unwrap();
        let mut host = guest("hank", RsvpStatus::Attending, &["vip"], Some("+15550000006"));
        host.role = GuestRole::Host;
        db.upsert_guest(&host).unwrap();
        // undeliverable: no phone, no token
        db.upsert_guest(&guest("gus", RsvpStatus::Pending, &["family"], None)).unwrap();

        db.upsert_device_token(&token("alice", "tok-a1")).unwrap();
        db.upsert_device_token(&token("bob", "tok-b1")).unwrap();
        db.upsert_device_token(&token("bob", "tok-b2")).unwrap();
        db.upsert_device_token(&token("erin", "tok-e1")).unwrap();
        Arc::new(db)
    }

    fn ids(recipients: &[Recipient]) -> Vec<&str> {
        recipients.iter().map(|r| r.guest_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_by_tags_deduplicates() {
        let resolver = RecipientResolver::new(seeded());
        let spec = AudienceSpec::ByTags(["vip".to_string(), "family".to_string()].into());
        let recipients = resolver.resolve(&spec, "evt-1").await.unwrap();

        assert_eq!(recipients.iter().filter(|r| r.guest_id == "alice").count(), 1);
        assert_eq!(ids(&recipients), vec!["alice", "bob", "dan"]);
    }

    #[tokio::test]
    async fn test_opt_out_excluded_under_every_spec() {
        let resolver = RecipientResolver::new(seeded());
        let specs = [
            AudienceSpec::All,
            AudienceSpec::ByStatus([RsvpStatus::Pending].into()),
            AudienceSpec::ByTags(["vip".to_string()].into()),
            AudienceSpec::ByIds(["erin".to_string(), "alice".to_string()].into()),
        ];
        for spec in specs {
            let recipients = resolver.resolve(&spec, "evt-1").await.unwrap();
            assert!(
                !recipients.iter().any(|r| r.guest_id == "erin"),
                "opted-out guest resolved under {spec:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_scenario_by_status_pending() {
        let resolver = RecipientResolver::new(seeded());
        let spec = AudienceSpec::ByStatus([RsvpStatus::Pending].into());
        let recipients = resolver.resolve(&spec, "evt-1").await.unwrap();

        assert_eq!(ids(&recipients), vec!["alice", "bob", "cara"]);
        let bob = &recipients[1];
        assert_eq!(bob.device_tokens.len(), 2);
        assert!(bob.phone_number.is_none());
        let cara = &recipients[2];
        assert!(!cara.has_push());
        assert!(cara.can_sms());
    }

    #[tokio::test]
    async fn test_hosts_only_when_named() {
        let resolver = RecipientResolver::new(seeded());
        let all = resolver.resolve(&AudienceSpec::All, "evt-1").await.unwrap();
        assert!(!ids(&all).contains(&"hank"));

        let named = resolver
            .resolve(&AudienceSpec::ByIds(["hank".to_string()].into()), "evt-1")
            .await
            .unwrap();
        assert_eq!(ids(&named), vec!["hank"]);
    }

    #[tokio::test]
    async fn test_undeliverable_and_empty() {
        let resolver = RecipientResolver::new(seeded());
        let all = resolver.resolve(&AudienceSpec::All, "evt-1").await.unwrap();
        assert!(!ids(&all).contains(&"gus"));

        let none = resolver
            .resolve(&AudienceSpec::ByTags(["nobody".to_string()].into()), "evt-1")
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_group_tokens_dedup() {
        let mut inactive = token("g1", "t3");
        inactive.is_active = false;
        let grouped = group_tokens(vec![token("g1", "t1"), token("g1", "t1"), token("g1", "t2"), inactive]);
        let list: Vec<_> = grouped["g1"].iter().map(|t| t.token.as_str()).collect();
        assert_eq!(list, vec!["t1", "t2"]);
    }

    struct DownStore;

    #[async_trait]
    impl RecipientStore for DownStore {
        async fn list_guests(&self, _: &str, _: &AudienceSpec) -> Result<Vec<GuestRecord>> {
            Err(UnveilError::Storage("connection refused".into()))
        }
        async fn list_active_device_tokens(&self, _: &[String]) -> Result<Vec<DeviceToken>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_resolution_error() {
        let resolver = RecipientResolver::new(Arc::new(DownStore));
        let err = resolver.resolve(&AudienceSpec::All, "evt-1").await.unwrap_err();
        assert!(matches!(err, UnveilError::Resolution(_)));
        assert!(err.is_job_level());
    }
}
