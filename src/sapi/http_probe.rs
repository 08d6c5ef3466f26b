use std::time::Duration;

use reqwest::Client;

/// Polls an HTTP endpoint of a SAPI instance.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpProbe {
    pub address: String,
    pub path: String,
    pub interval: Duration,
    pub max_retry: u64,
    pub timeout: Duration,
    /// Only 2xx responses count as ready; otherwise any response does.
    pub expect_success: bool,
}

impl HttpProbe {
    const INTERVAL: Duration = Duration::from_millis(100);

    /// A probe of `/` retried until `start_timeout` has passed.
    pub fn new(address: &str, start_timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            path: "/".to_string(),
            interval: Self::INTERVAL,
            max_retry: (start_timeout.as_millis() / Self::INTERVAL.as_millis()) as u64,
            timeout: Duration::from_secs(1),
            expect_success: false,
        }
    }

    fn url(&self) -> String {
        format!("http://{}{}", self.address, self.path)
    }

    /// Liveness check of a started instance. Only a failed connection counts as
    /// unreachable; a slow answer means the server is busy with another request.
    pub async fn is_reachable(&self) -> bool {
        let Ok(client) = Client::builder().timeout(self.timeout).build() else {
            return true;
        };
        match client.get(self.url()).send().await {
            Ok(_) => true,
            Err(err) => !err.is_connect(),
        }
    }

    async fn check_with(&self, client: &Client) -> bool {
        client
            .get(self.url())
            .send()
            .await
            .is_ok_and(|r| !self.expect_success || r.status().is_success())
    }

    pub async fn wait(&self) -> Result<(), String> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| format!("cannot create HTTP client: {}", err))?;

        if self.check_with(&client).await {
            return Ok(());
        }

        for _ in 0..self.max_retry {
            tokio::time::sleep(self.interval).await;

            if self.check_with(&client).await {
                return Ok(());
            }
        }

        Err(format!("HTTP endpoint {} is not ready", self.url()))
    }
}
