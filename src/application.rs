use crate::error::YakNsError;
use crate::server::RawNameServer;
use crate::transport::Transport;

use log::{error, info, warn};

/// Uncaught-error budget before the server gives up, overridable via
/// [Settings](crate::config::Settings).
pub const MAX_ERRORS: usize = 10;

/// Runs a [RawNameServer] on a transport: pull a message, run the pipeline,
/// send the reply.
///
/// Two error sinks: messages that fail to parse are logged at WARNING and
/// skipped, anything else uncaught burns error budget until the server
/// shuts itself down with exit code 1. An interrupt exits cleanly with 0.
pub struct DirectApplication {
    server: RawNameServer,
    transport: Box<dyn Transport>,
    max_errors: usize,
    exit_code: i32,
    shutdown_server: bool,
}

impl DirectApplication {
    pub fn new(server: impl Into<RawNameServer>, transport: Box<dyn Transport>) -> Self {
        DirectApplication {
            server: server.into(),
            transport,
            max_errors: MAX_ERRORS,
            exit_code: 0,
            shutdown_server: false,
        }
    }

    pub fn with_max_errors(self, max_errors: usize) -> Self {
        Self { max_errors, ..self }
    }

    /// Start the transport and process requests until shutdown.
    ///
    /// Returns the exit code: 0 if exited normally, 1 on startup failure or
    /// a blown error budget.
    pub async fn run(&mut self) -> i32 {
        info!("Starting {}", self.transport);
        if let Err(error) = self.transport.start_server().await {
            error!("Failed to start server: {error}");
            self.exit_code = 1;
            return self.exit_code;
        }

        let mut error_count: usize = 0;
        loop {
            if self.shutdown_server {
                break;
            }

            let received = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received");
                    self.shutdown_server = true;
                    continue;
                }
                received = self.transport.receive_message() => received,
            };

            let result = match received {
                Ok(mut message) => match self.server.process_message(&message.message) {
                    Ok(reply) => {
                        message.response = Some(reply);
                        self.transport.send_message_response(message).await
                    }
                    Err(error) => Err(error),
                },
                Err(error) => Err(error),
            };

            match result {
                Ok(()) => {}
                Err(error @ YakNsError::InvalidMessage { .. }) => {
                    warn!("{error}");
                }
                Err(error) => {
                    error!("Uncaught error occurred: {error}");
                    error_count += 1;
                    if self.max_errors > 0 && error_count >= self.max_errors {
                        error!("Max errors hit ({error_count}), shutting down");
                        self.shutdown_server = true;
                        self.exit_code = 1;
                    }
                }
            }
        }

        info!("Shutting down server");
        self.transport.stop_server().await;

        self.exit_code
    }
}
