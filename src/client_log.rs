use tokio::sync::mpsc;

/// Live ingest log. Upload endpoints stream these lines back to the client so
/// long parses show progress; warnings from §7-style recoverable errors land
/// here too. When no client is attached (CLI load, tests) lines only go to the
/// tracing subscriber. A send to a disconnected client is silently dropped —
/// ingest keeps running so the dataset is never left half-built by a closed
/// response.
#[derive(Clone)]
pub struct ClientLog {
    tx: Option<mpsc::Sender<String>>,
    echo: bool,
}

impl ClientLog {
    /// A log wired to a streaming HTTP response.
    pub fn channel(echo: bool) -> (ClientLog, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (
            ClientLog {
                tx: Some(tx),
                echo,
            },
            rx,
        )
    }

    /// A log that only echoes to the tracing subscriber.
    pub fn console() -> ClientLog {
        ClientLog {
            tx: None,
            echo: true,
        }
    }

    pub async fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        if self.echo {
            tracing::info!("{message}");
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(format!("{message}\n")).await;
        }
    }

    /// Progress marks: a dot every 2,500 items, a count line every 100,000.
    pub async fn progress(&self, count: u64, what: &str) {
        if count == 0 {
            return;
        }
        if count % 100_000 == 0 {
            self.log(format!("processed {count} {what}")).await;
        } else if count % 2_500 == 0 {
            if let Some(tx) = &self.tx {
                let _ = tx.send(".".to_string()).await;
            }
        }
    }

    /// Final JSON trailer carrying request metadata (e.g. a new dataset id).
    pub async fn finish(&self, metadata: serde_json::Value) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(metadata.to_string()).await;
        }
    }
}
