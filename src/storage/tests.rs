use super::*;

fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

#[test]
fn test_outbox_message_preserves_envelope() {
    let id = Uuid::new_v4();
    let correlation = Uuid::new_v4();
    let message = TransportMessage::builder(Bytes::from_static(b"{\"n\":1}"))
        .message_id(id)
        .correlation_id(Some(correlation))
        .message_type("OrderPlaced")
        .content_type("application/json")
        .header("Tenant", "acme")
        .build();

    let row = OutboxMessage::from_transport(&message, None, Some(url("amqp://broker/billing")));
    assert_eq!(row.message_id, id);
    assert!(!row.is_sent());

    let rebuilt = row.to_transport();
    assert_eq!(rebuilt.message_id(), Some(id));
    assert_eq!(rebuilt.correlation_id(), Some(correlation));
    assert_eq!(rebuilt.message_type(), Some("OrderPlaced"));
    assert_eq!(rebuilt.headers().get("tenant"), Some("acme"));
    assert_eq!(rebuilt.body(), message.body());
}

#[test]
fn test_outbox_message_assigns_id_when_missing() {
    let message = TransportMessage::builder(Bytes::new()).build();
    let row = OutboxMessage::from_transport(&message, None, None);
    assert!(!row.message_id.is_nil());
}

#[test]
fn test_scheduled_message_records_destination_header() {
    let id = Uuid::new_v4();
    let message = TransportMessage::builder(Bytes::from_static(b"{}"))
        .message_id(id)
        .content_type("application/json")
        .build();
    let destination = url("channel://local/reminders");

    let row = ScheduledMessage::from_transport(Uuid::new_v4(), &message, "ReminderDue", Some(&destination), Utc::now());
    assert_eq!(row.destination(), Some(destination));
    assert_eq!(row.content_type.as_deref(), Some("application/json"));

    let rebuilt = row.to_transport();
    assert_eq!(rebuilt.message_id(), Some(id));
    assert_eq!(rebuilt.message_type(), Some("ReminderDue"));
    assert_eq!(rebuilt.content_type(), Some("application/json"));
    assert!(!rebuilt.headers().contains_key(headers::DESTINATION_ADDRESS));
}

#[test]
fn test_scheduled_publish_has_no_destination() {
    let message = TransportMessage::builder(Bytes::new()).build();
    let row = ScheduledMessage::from_transport(Uuid::new_v4(), &message, "ReminderDue", None, Utc::now());
    assert!(row.destination().is_none());
}

#[test]
fn test_storage_config_deserializes_kind() {
    let config: StorageConfig =
        serde_json::from_value(serde_json::json!({"kind": "sqlite", "path": "/tmp/x.db"})).unwrap();
    assert_eq!(config.kind, StorageKind::Sqlite);
    assert_eq!(config.path, "/tmp/x.db");

    let defaults: StorageConfig = serde_json::from_value(serde_json::json!({})).unwrap();
    assert_eq!(defaults.kind, StorageKind::Memory);
}

#[tokio::test]
async fn test_init_storage_memory() {
    let stores = init_storage(&StorageConfig::default()).await.unwrap();
    let mut session = stores.sessions.begin().await.unwrap();
    let row = OutboxMessage::from_transport(&TransportMessage::builder(Bytes::new()).build(), None, None);
    session.add_outbox(&row).await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(stores.outbox.get_pending(10).await.unwrap().len(), 1);
}
