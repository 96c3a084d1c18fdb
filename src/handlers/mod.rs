//! Bus message handlers

pub mod import;
pub mod queries;

use std::sync::Arc;

use anyhow::Result;
use futures::future::{self, select_all};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::services::bus::MessageBus;
use crate::services::import_jobs::ImportJobTracker;
use crate::types::QueryKind;

use self::import::{handle_import_commands, ImportCommand};
use self::queries::{handle_queries, QueryResponder};

type HandlerTask = JoinHandle<Result<()>>;

/// Registration table of running topic handlers
pub struct HandlerSet {
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, HandlerTask)>,
}

impl HandlerSet {
    pub fn topics(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(topic, _)| *topic).collect()
    }

    /// Resolves when any handler loop ends on its own
    pub async fn first_exit(&mut self) -> (&'static str, Result<Result<()>, JoinError>) {
        if self.tasks.is_empty() {
            return future::pending().await;
        }
        let (result, index, _) = select_all(self.tasks.iter_mut().map(|(_, task)| task)).await;
        let (topic, _) = self.tasks.remove(index);
        (topic, result)
    }

    /// Cancel every handler and wait for the loops to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for (topic, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Handler for {} failed: {}", topic, e),
                Err(e) => error!("Handler for {} panicked: {}", topic, e),
            }
        }
        info!("All handlers stopped");
    }
}

/// Subscribe to every query and import topic and start serving
pub async fn start_handlers(
    bus: Arc<dyn MessageBus>,
    responder: Arc<QueryResponder>,
    tracker: ImportJobTracker,
    service_name: &str,
    consumer_group: &str,
) -> Result<HandlerSet> {
    info!("Starting message handlers on {} bus...", bus.name());

    let shutdown = CancellationToken::new();
    let service_name: Arc<str> = Arc::from(service_name);
    let mut tasks: Vec<(&'static str, HandlerTask)> = Vec::new();

    for kind in QueryKind::ALL {
        let requests = bus.subscribe(kind.request_topic(), Some(consumer_group)).await?;
        let task = tokio::spawn(handle_queries(
            bus.clone(),
            service_name.clone(),
            kind,
            requests,
            responder.clone(),
            shutdown.child_token(),
        ));
        tasks.push((kind.request_topic(), task));
    }

    for command in ImportCommand::ALL {
        let requests = bus.subscribe(command.topic(), Some(consumer_group)).await?;
        let task = tokio::spawn(handle_import_commands(
            bus.clone(),
            service_name.clone(),
            command,
            requests,
            tracker.clone(),
            shutdown.child_token(),
        ));
        tasks.push((command.topic(), task));
    }

    info!("Subscribed to {} topics (group {})", tasks.len(), consumer_group);

    Ok(HandlerSet { shutdown, tasks })
}
