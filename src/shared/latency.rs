use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

/// Reported when a server could not be measured.
pub const UNREACHABLE: i64 = -1;

pub const GENERATE_204_URL: &str = "http://www.gstatic.com/generate_204";

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub tcp_timeout: Duration,
    pub tcp_attempts: u32,
    pub tcp_retry_delay: Duration,
    pub http_timeout: Duration,
    pub http_url: String,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(3),
            tcp_attempts: 2,
            tcp_retry_delay: Duration::from_millis(200),
            http_timeout: Duration::from_secs(5),
            http_url: GENERATE_204_URL.to_string(),
        }
    }
}

/// Time to a successful TCP connect to `host:port`.
///
/// Elapsed time runs from the start of the first attempt, so a retry is
/// included in the figure. Refused connections count as failures.
pub async fn tcp_latency(host: &str, port: u16, opts: &ProbeOptions) -> Result<Duration, String> {
    let address = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };

    let started = Instant::now();
    let mut last_error = String::from("no attempts made");
    for attempt in 0..opts.tcp_attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(opts.tcp_retry_delay).await;
        }
        match tokio::time::timeout(opts.tcp_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => return Ok(started.elapsed()),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {}ms", opts.tcp_timeout.as_millis()),
        }
    }
    Err(format!("Connection failed to {}: {}", address, last_error))
}

/// Round trip of an HTTP HEAD sent through the local SOCKS5 listener.
///
/// Only 200 and 204 count; anything else means the tunnel is not carrying
/// traffic even if the listener answered.
pub async fn proxied_latency(mixed_port: u16, opts: &ProbeOptions) -> Result<Duration, String> {
    let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", mixed_port))
        .map_err(|e| e.to_string())?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(opts.http_timeout)
        .build()
        .map_err(|e| e.to_string())?;

    let started = Instant::now();
    let response = client
        .head(&opts.http_url)
        .send()
        .await
        .map_err(|e| format!("Real delay check failed: {}", e))?;
    let status = response.status().as_u16();
    if status == 200 || status == 204 {
        Ok(started.elapsed())
    } else {
        Err(format!("Real delay check returned HTTP {}", status))
    }
}

/// Whole milliseconds, or [`UNREACHABLE`].
#[must_use]
pub fn millis_or_unreachable<E>(result: &Result<Duration, E>) -> i64 {
    match result {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        Err(_) => UNREACHABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> ProbeOptions {
        ProbeOptions {
            tcp_timeout: Duration::from_millis(300),
            tcp_attempts: 2,
            tcp_retry_delay: Duration::from_millis(20),
            http_timeout: Duration::from_millis(500),
            http_url: GENERATE_204_URL.to_string(),
        }
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        listener.local_addr().expect("local addr").port()
    }

    #[tokio::test]
    async fn tcp_latency_measures_open_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let port = listener.local_addr().expect("listener local addr").port();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });

        let result = tcp_latency("127.0.0.1", port, &quick()).await;
        assert!(result.is_ok());
        assert!(millis_or_unreachable(&result) >= 0);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let port = closed_port().await;
        let result = tcp_latency("127.0.0.1", port, &quick()).await;

        assert_eq!(millis_or_unreachable(&result), UNREACHABLE);
        assert!(result.unwrap_err().contains("Connection failed"));
    }

    #[tokio::test]
    async fn blackholed_host_gives_up_after_attempts() {
        let opts = quick();
        let started = std::time::Instant::now();
        let result = tcp_latency("192.0.2.1", 443, &opts).await;

        assert_eq!(millis_or_unreachable(&result), UNREACHABLE);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn proxied_probe_without_listener_fails() {
        let port = closed_port().await;
        let result = proxied_latency(port, &quick()).await;
        assert_eq!(millis_or_unreachable(&result), UNREACHABLE);
    }
}
