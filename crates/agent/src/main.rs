//! `autonom` -- AWS IoT Jobs agent that runs Ansible tasks.
//!
//! Connects to AWS IoT over MQTT/TLS as a single thing, claims the next
//! pending job execution, runs the job document's `tasks` with its `vars`
//! through `ansible-playbook` on this host, and reports `SUCCEEDED` or
//! `FAILED` back to the job queue. The queue is probed on a fixed
//! interval; notifications from the queue trigger immediate probes.
//!
//! # Environment variables
//!
//! | Variable                       | Required | Default            | Description                          |
//! |--------------------------------|----------|--------------------|--------------------------------------|
//! | `AUTONOM_THING_NAME`           | yes      | --                 | AWS IoT thing name                   |
//! | `AUTONOM_HOST_NAME`            | yes      | --                 | AWS IoT endpoint host                |
//! | `AUTONOM_PORT`                 | no       | `8883`             | MQTT/TLS port                        |
//! | `AUTONOM_CA_PATH`              | yes      | --                 | Root CA PEM                          |
//! | `AUTONOM_KEY_PATH`             | yes      | --                 | Thing private key PEM                |
//! | `AUTONOM_CERT_PATH`            | yes      | --                 | Thing certificate PEM                |
//! | `AUTONOM_CLIENT_ID`            | no       | random UUID        | MQTT client id                       |
//! | `AUTONOM_INTERVAL_SECS`        | no       | `60`               | Seconds between queue probes         |
//! | `AUTONOM_PUBLISH_TIMEOUT_SECS` | no       | `5`                | Timeout for a single publish         |
//! | `AUTONOM_ANSIBLE_PLAYBOOK`     | no       | `ansible-playbook` | Ansible entrypoint                   |
//! | `AUTONOM_TASK_TIMEOUT_SECS`    | no       | `3600`             | Upper bound on one job's run         |

use std::process::ExitCode;
use std::sync::Arc;

use autonom_agent::config::AgentConfig;
use autonom_agent::executor::TaskJobExecutor;
use autonom_agent::poller::run_poll_loop;
use autonom_agent::processor::JobProcessor;
use autonom_agent::publisher::{Publisher, PublisherConfig, DEFAULT_QUEUE_CAPACITY};
use autonom_agent::runner::AnsibleRunner;
use autonom_agent::shutdown::{install_shutdown_handler, join_logged};
use autonom_agent::transport::mqtt::{MqttSettings, MqttTransport};
use autonom_core::ThingTopics;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autonom_agent=info,autonom=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    let topics = match ThingTopics::new(&config.thing_name) {
        Ok(topics) => topics,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    tracing::info!(
        thing_name = %config.thing_name,
        host = %config.host_name,
        client_id = %config.client_id,
        interval_secs = config.interval.as_secs(),
        "Starting autonom",
    );

    let cancel = match install_shutdown_handler() {
        Ok(cancel) => cancel,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            return ExitCode::from(1);
        }
    };

    match run(config, topics, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "autonom stopped with an error");
            ExitCode::from(2)
        }
    }
}

async fn run(
    config: AgentConfig,
    topics: ThingTopics,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), autonom_agent::transport::TransportError> {
    let (transport, inbound, event_loop) =
        MqttTransport::start(MqttSettings::from_config(&config), cancel.clone()).await?;
    let transport = Arc::new(transport);

    let (publisher, publish_worker) = Publisher::spawn(
        transport.clone(),
        PublisherConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_timeout: config.publish_timeout,
        },
        cancel.clone(),
    );

    let runner = AnsibleRunner::new(&config.ansible_playbook).with_timeout(config.task_timeout);
    let processor = Arc::new(JobProcessor::new(
        topics,
        config.client_id.clone(),
        Arc::new(TaskJobExecutor::new(runner)),
        publisher,
    ));

    processor.subscribe(transport.as_ref()).await?;

    let dispatch = tokio::spawn(Arc::clone(&processor).run(inbound, cancel.clone()));

    run_poll_loop(Arc::clone(&processor), config.interval, cancel.clone()).await;

    // The poll loop only returns once shutdown has been requested.
    join_logged("dispatch", dispatch).await;
    join_logged("publisher", publish_worker).await;
    join_logged("mqtt event loop", event_loop).await;

    tracing::info!(status = ?processor.status(), "autonom stopped");
    Ok(())
}
