//! Import command handlers
//!
//! Same correlation protocol as the queries: every command with a correlation
//! id is answered on `<topic>.response` with either `ok: true` and a result
//! or `ok: false` and an error code.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::services::bus::{EnvelopeStream, MessageBus};
use crate::services::import_jobs::{AsyncImportRequest, ImportJobTracker};
use crate::types::{
    response_topic, CommandResponse, GetImportJobCommand, ImportError, MessageEnvelope,
    RollbackImportCommand, RunImportCommand, SubmitImportCommand, ValidateImportCommand,
    EVENT_IMPORT_COMMAND, EVENT_IMPORT_COMMAND_RESULT, TOPIC_IMPORT_GET, TOPIC_IMPORT_ROLLBACK, TOPIC_IMPORT_RUN,
    TOPIC_IMPORT_SUBMIT, TOPIC_IMPORT_VALIDATE,
};

/// Import operations reachable over the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportCommand {
    Submit,
    Get,
    Rollback,
    Validate,
    Run,
}

impl ImportCommand {
    pub const ALL: [ImportCommand; 5] = [
        ImportCommand::Submit,
        ImportCommand::Get,
        ImportCommand::Rollback,
        ImportCommand::Validate,
        ImportCommand::Run,
    ];

    pub fn topic(&self) -> &'static str {
        match self {
            ImportCommand::Submit => TOPIC_IMPORT_SUBMIT,
            ImportCommand::Get => TOPIC_IMPORT_GET,
            ImportCommand::Rollback => TOPIC_IMPORT_ROLLBACK,
            ImportCommand::Validate => TOPIC_IMPORT_VALIDATE,
            ImportCommand::Run => TOPIC_IMPORT_RUN,
        }
    }
}

#[derive(Debug, Error)]
enum CommandFault {
    #[error("Malformed command: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Import(#[from] ImportError),
}

impl CommandFault {
    fn code(&self) -> &'static str {
        match self {
            CommandFault::Decode(_) => "INVALID_REQUEST",
            CommandFault::Import(e) => e.code(),
        }
    }
}

async fn run_command(
    tracker: &ImportJobTracker,
    command: ImportCommand,
    envelope: &MessageEnvelope,
) -> Result<serde_json::Value, CommandFault> {
    let value = match command {
        ImportCommand::Submit => {
            let cmd: SubmitImportCommand = envelope.decode()?;
            let job = tracker
                .start_async_import(AsyncImportRequest {
                    user_id: cmd.user_id,
                    file_name: cmd.file_name,
                    file_size: cmd.file_size,
                    csv_content: cmd.csv_content,
                    mode: cmd.mode,
                    skip_errors: cmd.skip_errors,
                })
                .await?;
            serde_json::to_value(job)?
        }
        ImportCommand::Get => {
            let cmd: GetImportJobCommand = envelope.decode()?;
            serde_json::to_value(tracker.get_import_job(cmd.job_id, cmd.user_id).await?)?
        }
        ImportCommand::Rollback => {
            let cmd: RollbackImportCommand = envelope.decode()?;
            let result = tracker
                .rollback_import(cmd.job_id, cmd.reason, cmd.user_id)
                .await?;
            serde_json::to_value(result)?
        }
        ImportCommand::Validate => {
            let cmd: ValidateImportCommand = envelope.decode()?;
            serde_json::to_value(tracker.validate(&cmd.csv_content, cmd.mode, cmd.user_id).await?)?
        }
        ImportCommand::Run => {
            let cmd: RunImportCommand = envelope.decode()?;
            let result = tracker
                .import_sync(&cmd.csv_content, cmd.mode, cmd.skip_errors, cmd.user_id)
                .await?;
            serde_json::to_value(result)?
        }
    };
    Ok(value)
}

/// The response to publish, or `None` when there is nobody to answer
pub async fn execute(
    tracker: &ImportJobTracker,
    command: ImportCommand,
    envelope: &MessageEnvelope,
) -> Option<CommandResponse> {
    let Some(correlation_id) = envelope.correlation_id() else {
        warn!("{} command without correlation id dropped", command.topic());
        return None;
    };

    match run_command(tracker, command, envelope).await {
        Ok(result) => Some(CommandResponse::success(correlation_id, result)),
        Err(fault) => {
            warn!("{} ({}) failed: {}", command.topic(), correlation_id, fault);
            Some(CommandResponse::failure(correlation_id, fault.code(), fault.to_string()))
        }
    }
}

/// Serve one import command topic until shutdown
pub async fn handle_import_commands(
    bus: Arc<dyn MessageBus>,
    service_name: Arc<str>,
    command: ImportCommand,
    mut requests: EnvelopeStream,
    tracker: ImportJobTracker,
    shutdown: CancellationToken,
) -> Result<()> {
    let reply_topic = response_topic(command.topic());

    loop {
        let envelope = select! {
            _ = shutdown.cancelled() => break,
            next = requests.next() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        debug!("Received {} command", command.topic());
        if envelope.event_type != EVENT_IMPORT_COMMAND {
            debug!(
                "{} carries event type {}, handling it anyway",
                command.topic(),
                envelope.event_type
            );
        }

        let bus = bus.clone();
        let service_name = service_name.clone();
        let tracker = tracker.clone();
        let reply_topic = reply_topic.clone();
        tokio::spawn(async move {
            let Some(response) = execute(&tracker, command, &envelope).await else {
                return;
            };
            let published = match MessageEnvelope::new(EVENT_IMPORT_COMMAND_RESULT, service_name.as_ref(), &response) {
                Ok(reply) => bus.publish(&reply_topic, &reply).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = published {
                error!(
                    "Failed to publish {} response for {}: {}",
                    command.topic(),
                    response.correlation_id,
                    e
                );
            }
        });
    }

    Ok(())
}
