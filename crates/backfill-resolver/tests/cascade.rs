use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use backfill_core::Identifier;
use backfill_resolver::{
    BatchResolver, ContractLookup, LookupError, LookupRow, ResolverConfig, Tier,
};

fn id(raw: &str) -> Identifier {
    Identifier::parse(raw).expect("valid identifier")
}

fn row(identifier: &str, name: &str, role: &str) -> LookupRow {
    LookupRow {
        identifier: identifier.to_string(),
        client_name: name.to_string(),
        holder_role: role.to_string(),
        amount: Some(100.0),
        contract_date: Some("2024-01-15".to_string()),
    }
}

/// Lookup double whose tiers fail or answer from a fixed row table.
#[derive(Default)]
struct ScriptedLookup {
    rows: Vec<LookupRow>,
    ranked_error: Option<LookupError>,
    ordered_error: Option<LookupError>,
    failing_singles: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedLookup {
    fn rows_for(&self, ids: &[Identifier]) -> Vec<LookupRow> {
        let wanted: HashSet<&str> = ids.iter().map(|i| i.as_str()).collect();
        self.rows
            .iter()
            .filter(|r| wanted.contains(r.identifier.as_str()))
            .cloned()
            .collect()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContractLookup for ScriptedLookup {
    async fn ranked_batch(&self, ids: &[Identifier]) -> Result<Vec<LookupRow>, LookupError> {
        self.calls.lock().unwrap().push(format!("ranked:{}", ids.len()));
        match &self.ranked_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.rows_for(ids)),
        }
    }

    async fn ordered_batch(&self, ids: &[Identifier]) -> Result<Vec<LookupRow>, LookupError> {
        self.calls.lock().unwrap().push(format!("ordered:{}", ids.len()));
        match &self.ordered_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.rows_for(ids)),
        }
    }

    async fn top_for(&self, id: &Identifier) -> Result<Option<LookupRow>, LookupError> {
        self.calls.lock().unwrap().push(format!("single:{id}"));
        if self.failing_singles.contains(id.as_str()) {
            return Err(LookupError::Query(format!("boom {id}")));
        }
        Ok(self.rows_for(std::slice::from_ref(id)).into_iter().next())
    }
}

#[tokio::test]
async fn ordered_fallback_keeps_highest_priority_row() {
    let lookup = ScriptedLookup {
        rows: vec![
            row("1001", "Ana Otro", "OTRO"),
            row("1001", "Zoe Titular", "TITULAR"),
            row("1002", "Bea", "TITULAR"),
        ],
        ranked_error: Some(LookupError::Unsupported("ROW_NUMBER".into())),
        ..Default::default()
    };
    let resolver = BatchResolver::new(ResolverConfig::default());
    let batch = [id("1001"), id("1002"), id("1003")];

    let resolution = resolver.resolve(&lookup, &batch).await;

    assert_eq!(resolution.resolved_count(), 2);
    assert_eq!(resolution.get(&id("1001")).unwrap().client_name, "Zoe Titular");
    assert_eq!(resolution.get(&id("1002")).unwrap().client_name, "Bea");
    assert!(resolution.get(&id("1003")).is_none());
    assert_eq!(resolution.tier_counts.get(&Tier::OrderedBatch), Some(&1));
    assert_eq!(lookup.calls(), vec!["ranked:3", "ordered:3"]);
}

#[tokio::test]
async fn per_identifier_tier_swallows_individual_failures() {
    let lookup = ScriptedLookup {
        rows: vec![row("2001", "Carlos", "TITULAR"), row("2002", "Dora", "PROPIETARIO")],
        ranked_error: Some(LookupError::Unsupported("window".into())),
        ordered_error: Some(LookupError::Query("timeout".into())),
        failing_singles: ["2002".to_string()].into_iter().collect(),
        ..Default::default()
    };
    let resolver = BatchResolver::new(ResolverConfig { batch_size: 10 });
    let batch = [id("2001"), id("2002"), id("2003")];

    let resolution = resolver.resolve(&lookup, &batch).await;

    assert_eq!(resolution.resolved_count(), 1);
    assert!(resolution.get(&id("2001")).is_some());
    assert!(resolution.get(&id("2002")).is_none());
    assert!(resolution.get(&id("2003")).is_none());
    assert!(resolution.failed_batches.is_empty());
    assert_eq!(resolution.tier_counts.get(&Tier::PerIdentifier), Some(&1));
}

#[tokio::test]
async fn connection_failure_leaves_batch_unmatched_and_continues() {
    let lookup = ScriptedLookup {
        rows: vec![row("3001", "Eva", "TITULAR")],
        ranked_error: Some(LookupError::Connection("socket closed".into())),
        ..Default::default()
    };
    let resolver = BatchResolver::new(ResolverConfig { batch_size: 2 });
    let batch = [id("3001"), id("3002"), id("3003")];

    let resolution = resolver.resolve(&lookup, &batch).await;

    assert_eq!(resolution.resolved_count(), 0);
    assert_eq!(resolution.batches, 2);
    assert_eq!(resolution.failed_batches.len(), 2);
    assert_eq!(resolution.failed_batches[0].identifiers, 2);
    assert_eq!(resolution.failed_batches[1].identifiers, 1);
    assert!(lookup.calls().iter().all(|c| c.starts_with("ranked:")));
}

#[tokio::test]
async fn duplicates_are_looked_up_once_and_batched() {
    let rows = (0..120)
        .map(|i| row(&format!("{:05}", 10_000 + i), &format!("Client {i}"), "TITULAR"))
        .collect::<Vec<_>>();
    let lookup = ScriptedLookup {
        rows,
        ..Default::default()
    };
    let mut ids: Vec<Identifier> = (0..120).map(|i| id(&format!("{:05}", 10_000 + i))).collect();
    ids.extend(ids.clone());

    let resolver = BatchResolver::new(ResolverConfig { batch_size: 50 });
    let resolution = resolver.resolve(&lookup, &ids).await;

    assert_eq!(resolution.candidates, 120);
    assert_eq!(resolution.batches, 3);
    assert_eq!(resolution.resolved_count(), 120);
    assert_eq!(lookup.calls(), vec!["ranked:50", "ranked:50", "ranked:20"]);
}

#[tokio::test]
async fn empty_input_resolves_nothing() {
    let lookup = ScriptedLookup::default();
    let resolution = BatchResolver::new(ResolverConfig::default())
        .resolve(&lookup, &[])
        .await;
    assert_eq!(resolution.batches, 0);
    assert!(resolution.records.is_empty());
    assert!(lookup.calls().is_empty());
}
