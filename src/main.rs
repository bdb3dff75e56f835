use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use visor_client::{
    Client,
    config::Config,
    decoder::VideoDecoder,
    observer::NullObserver,
    signaling::{DirectoryError, HostRecord, SignalingDirectory},
};

/// Directory-less operation: the configured `[host]` address is the one
/// and only record. Useful on LANs and in test rigs where no cloud
/// directory is running.
struct StaticDirectory {
    host: HostRecord,
}

#[async_trait]
impl SignalingDirectory for StaticDirectory {
    async fn publish_endpoint(&self, listen_port: u16, user_id: &str) -> Result<(), DirectoryError> {
        log::debug!("publish skipped (static): port={}, user={}", listen_port, user_id);
        Ok(())
    }

    async fn fetch_host_candidates(&self, _: &str) -> Result<Vec<HostRecord>, DirectoryError> {
        Ok(vec![self.host.clone()])
    }
}

/// Headless decoder: counts access units and logs the cadence. Stands in
/// for a platform decoder when running the core from the command line.
#[derive(Default)]
struct LogDecoder {
    frames: u64,
}

impl VideoDecoder for LogDecoder {
    fn set_vps(&mut self, bytes: &[u8]) {
        log::info!("vps: {} bytes", bytes.len());
    }

    fn set_sps(&mut self, bytes: &[u8]) {
        log::info!("sps: {} bytes", bytes.len());
    }

    fn set_pps(&mut self, bytes: &[u8]) {
        log::info!("pps: {} bytes", bytes.len());
    }

    fn decode(&mut self, annex_b: &[u8], pts: u64) -> Result<(), String> {
        self.frames += 1;
        if self.frames % 60 == 0 {
            log::info!("decoded {} frames, last: {} bytes, pts={}", self.frames, annex_b.len(), pts);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    let Some(ip) = config.host.ip else {
        anyhow::bail!("no host configured: set [host] ip in the config file");
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let directory = StaticDirectory {
        host: HostRecord {
            user_id: config.target_user.clone(),
            device_name: "configured host".to_string(),
            local_ip: ip,
            local_port: config.host.port,
            public_ip: None,
            public_port: None,
            is_online: true,
            last_heartbeat: now,
            ice_candidates: None,
        },
    };

    let client = Client::new(config, directory, Arc::new(NullObserver));
    client.run(LogDecoder::default()).await?;
    Ok(())
}
