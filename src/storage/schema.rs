//! Relational schema identifiers for sea-query.
//!
//! Table and column names follow the persisted schema shared with other
//! implementations of the same stores, hence the PascalCase identifiers.

use sea_query::Iden;

#[derive(Iden, Clone, Copy)]
#[iden = "OutboxMessages"]
pub enum OutboxMessages {
    Table,
    #[iden = "MessageId"]
    MessageId,
    #[iden = "CorrelationId"]
    CorrelationId,
    #[iden = "ConversationId"]
    ConversationId,
    #[iden = "SourceAddress"]
    SourceAddress,
    #[iden = "DestinationAddress"]
    DestinationAddress,
    #[iden = "MessageType"]
    MessageType,
    #[iden = "ContentType"]
    ContentType,
    #[iden = "Body"]
    Body,
    #[iden = "Headers"]
    Headers,
    #[iden = "EnqueuedTime"]
    EnqueuedTime,
    #[iden = "SentTime"]
    SentTime,
}

#[derive(Iden, Clone, Copy)]
#[iden = "InboxStates"]
pub enum InboxStates {
    Table,
    #[iden = "MessageId"]
    MessageId,
    #[iden = "ConsumerId"]
    ConsumerId,
    #[iden = "ReceivedTime"]
    ReceivedTime,
    #[iden = "ProcessedTime"]
    ProcessedTime,
}

#[derive(Iden, Clone, Copy)]
#[iden = "ScheduledMessages"]
pub enum ScheduledMessages {
    Table,
    #[iden = "TokenId"]
    TokenId,
    #[iden = "MessageType"]
    MessageType,
    #[iden = "ContentType"]
    ContentType,
    #[iden = "Body"]
    Body,
    #[iden = "Headers"]
    Headers,
    #[iden = "ScheduledTime"]
    ScheduledTime,
    #[iden = "CreatedTime"]
    CreatedTime,
    #[iden = "DispatchedTime"]
    DispatchedTime,
}

#[derive(Iden, Clone, Copy)]
#[iden = "SagaStates"]
pub enum SagaStates {
    Table,
    #[iden = "CorrelationId"]
    CorrelationId,
    #[iden = "StateType"]
    StateType,
    #[iden = "StateData"]
    StateData,
    #[iden = "ConversationId"]
    ConversationId,
    #[iden = "UpdatedTime"]
    UpdatedTime,
    #[iden = "Version"]
    Version,
    #[iden = "HandledMessages"]
    HandledMessages,
}
