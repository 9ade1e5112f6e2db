// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use super::{redact, AuditEntry, AuditKind, AuditLog, AuditQuery};

const RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[test]
fn redaction_masks_password_and_drops_tokens() {
    let mut details = BTreeMap::from([
        ("password".to_owned(), json!("p")),
        ("token".to_owned(), json!("t")),
        ("accessToken".to_owned(), json!("a")),
        ("refresh_token".to_owned(), json!("r")),
        ("secret".to_owned(), json!("s")),
        ("agentName".to_owned(), json!("alpha")),
    ]);
    redact(&mut details);

    assert_eq!(details.get("password"), Some(&Value::String("[REDACTED]".to_owned())));
    assert!(!details.contains_key("token"));
    assert!(!details.contains_key("accessToken"));
    assert!(!details.contains_key("refresh_token"));
    assert!(!details.contains_key("secret"));
    assert_eq!(details.get("agentName"), Some(&json!("alpha")));
}

#[tokio::test]
async fn record_and_query_round_trip() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let log = AuditLog::open(Some(tmp.path()), RETENTION);
    let agent = Uuid::new_v4();

    log.record(AuditEntry::new(AuditKind::AgentConnect).with_agent(agent));
    log.record(AuditEntry::new(AuditKind::UserLogin).with_user("op").with_detail("password", "p"));

    let all = log.query(&AuditQuery::default()).await;
    assert_eq!(all.len(), 2);

    let logins = log.query(&AuditQuery { kind: Some(AuditKind::UserLogin), ..Default::default() }).await;
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].details.get("password"), Some(&json!("[REDACTED]")));

    let by_agent = log.query(&AuditQuery { agent_id: Some(agent), ..Default::default() }).await;
    assert_eq!(by_agent.len(), 1);
    assert_eq!(by_agent[0].kind, AuditKind::AgentConnect);
    Ok(())
}

#[tokio::test]
async fn duplicate_ids_are_written_once() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let log = AuditLog::open(Some(tmp.path()), RETENTION);

    let entry = AuditEntry::new(AuditKind::ConfigChange);
    log.record(entry.clone());
    log.record(entry);

    let all = log.query(&AuditQuery::default()).await;
    assert_eq!(all.len(), 1);
    Ok(())
}

#[tokio::test]
async fn retention_hides_expired_entries() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let log = AuditLog::open(Some(tmp.path()), Duration::from_secs(60));

    let mut old = AuditEntry::new(AuditKind::UserLogout);
    old.timestamp_ms -= 10 * 60 * 1000;
    log.record(old);
    log.record(AuditEntry::new(AuditKind::UserLogin));

    let visible = log.query(&AuditQuery::default()).await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].kind, AuditKind::UserLogin);

    // The expired line is still in the file, untouched, until archived.
    let archived = log.archive_expired().await;
    assert_eq!(archived, 1);
    let visible = log.query(&AuditQuery::default()).await;
    assert_eq!(visible.len(), 1);
    Ok(())
}

#[tokio::test]
async fn half_open_time_range() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    // Wide retention so the synthetic epoch-adjacent timestamps stay visible.
    let log = AuditLog::open(Some(tmp.path()), Duration::from_secs(1 << 40));

    let mut first = AuditEntry::new(AuditKind::UserLogin);
    first.timestamp_ms = 1000;
    let mut second = AuditEntry::new(AuditKind::UserLogin);
    second.timestamp_ms = 2000;
    log.record(first);
    log.record(second);

    let range = log
        .query(&AuditQuery { since_ms: Some(1000), until_ms: Some(2000), ..Default::default() })
        .await;
    assert_eq!(range.len(), 1);
    assert_eq!(range[0].timestamp_ms, 1000);
    Ok(())
}

#[tokio::test]
async fn query_limit_defaults_to_100() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let log = AuditLog::open(Some(tmp.path()), RETENTION);
    for _ in 0..120 {
        log.record(AuditEntry::new(AuditKind::ConfigChange));
    }
    assert_eq!(log.query(&AuditQuery::default()).await.len(), 100);
    assert_eq!(
        log.query(&AuditQuery { limit: Some(5), ..Default::default() }).await.len(),
        5
    );
    Ok(())
}

#[tokio::test]
async fn sweep_marks_unfinished_commands_failed() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let finished = Uuid::new_v4();
    let orphaned = Uuid::new_v4();
    {
        let log = AuditLog::open(Some(tmp.path()), RETENTION);
        log.record(AuditEntry::new(AuditKind::CommandSent).with_command(finished));
        log.record(AuditEntry::new(AuditKind::CommandCompleted).with_command(finished));
        log.record(AuditEntry::new(AuditKind::CommandSent).with_command(orphaned));
        log.flush().await;
    }

    // "Restart": reopen and sweep.
    let log = AuditLog::open(Some(tmp.path()), RETENTION);
    let swept = log.sweep_unfinished().await;
    assert_eq!(swept, vec![orphaned]);

    let completions = log
        .query(&AuditQuery { kind: Some(AuditKind::CommandCompleted), ..Default::default() })
        .await;
    assert_eq!(completions.len(), 2);
    let synthetic = completions.iter().find(|e| e.command_id == Some(orphaned));
    assert!(synthetic.is_some_and(|e| e.details.get("reason") == Some(&json!("shutdown"))));

    // A second sweep is a no-op.
    assert!(log.sweep_unfinished().await.is_empty());
    Ok(())
}
