//! Process wiring: bus, hub, router subscriptions and matcher.

use crate::config::LoadedConfig;
use crate::state::AppState;
use alertcast_core::alerts;
use alertcast_core::bus::{MessageBus, Topic};
use alertcast_core::config::{ConfigStore, MatcherConfig};
use alertcast_core::events::connection_located_channel;
use alertcast_core::gateway::{GatewayHandle, Hub};
use alertcast_core::processors::{GeoAlertMatcher, NotificationRouter, RouterSubscription};
use alertcast_core::registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Every long-running component of a serving process.
pub struct App {
    pub state: AppState,
    /// Live matcher settings; the SIGHUP handler writes here.
    pub matcher_config: ConfigStore<MatcherConfig>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Connect the bus and spawn the hub, one router task per subscription
    /// and the matcher.
    pub async fn start(config: &LoadedConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let bus = MessageBus::from_config(&config.bus).await;
        let report = bus.ensure_topology(&Topic::ALL).await;
        if report.failures() > 0 {
            tracing::warn!(
                failures = report.failures(),
                "Bus topology incomplete, some subscriptions may not deliver"
            );
        }

        let (located_tx, located_rx) = connection_located_channel();
        let hub = Hub::new(ConnectionRegistry::new(&config.routing.country))
            .with_located_sender(located_tx);
        let (gateway, hub_task) = GatewayHandle::spawn(hub, shutdown_rx.clone());
        tasks.push(hub_task);

        let router = Arc::new(NotificationRouter::new(gateway.clone(), &config.routing));
        for topic in Topic::ALL {
            let handler = Arc::new(RouterSubscription::new(Arc::clone(&router)));
            match bus.subscribe(topic.subscription(), handler, shutdown_rx.clone()) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::error!(%topic, error = %e, "Failed to subscribe"),
            }
        }

        let matcher_config = ConfigStore::new(config.matcher.clone());
        let matcher = Arc::new(GeoAlertMatcher::new(
            gateway.clone(),
            alerts::from_config(&config.alerts),
            matcher_config.clone(),
        ));
        tasks.push(tokio::spawn(matcher.run(
            shutdown_rx.clone(),
            located_rx,
            matcher_config.subscribe(),
        )));

        tracing::info!(
            backbone = bus.backbone_name(),
            degraded = bus.is_degraded(),
            country = %config.routing.country,
            "All components started"
        );

        Self {
            state: AppState::new(gateway, bus, shutdown_rx),
            matcher_config,
            shutdown_tx,
            tasks,
        }
    }

    /// Signal every component and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("All components stopped");
    }
}
