use thiserror::Error;

/// Errors produced while reading a sensor value.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{probe}: {message}")]
    Probe { probe: &'static str, message: String },

    #[error("sensor {id}: failed to run script: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sensor {id}: script exited with {status}: {stderr}")]
    Script {
        id: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("sensor {0} is unavailable: no counter baseline yet")]
    Unavailable(String),

    #[error("sensor {0}: sampling task has stopped")]
    SamplerStopped(String),
}

impl SensorError {
    pub(crate) fn probe(probe: &'static str, message: impl ToString) -> Self {
        SensorError::Probe {
            probe,
            message: message.to_string(),
        }
    }
}

/// Errors raised by a [`crate::broker::Publisher`].
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to queue publish to {topic}: {message}")]
    Client { topic: String, message: String },

    #[error("no acknowledgment for {topic} within {seconds}s")]
    AckTimeout { topic: String, seconds: u64 },

    #[error("broker event loop has stopped")]
    Closed,
}
