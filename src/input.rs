use std::net::SocketAddr;

use ahash::AHashMap;
use bytes::BytesMut;
use tokio::{
    net::UdpSocket,
    time::{Duration, Instant},
};

use proto::input::InputEvent;

/// minimum spacing for throttled event classes.
pub const MIN_EVENT_INTERVAL: Duration = Duration::from_millis(30);

/// Per-event-class minimum-interval throttle on a monotonic clock.
///
/// State-transition events (zoom start/end) bypass the throttle so the
/// host never misses the edge even under a pointer-move flood.
struct Throttle {
    last_sent: AHashMap<u8, Instant>,
}

impl Throttle {
    fn new() -> Self {
        Self {
            last_sent: AHashMap::new(),
        }
    }

    fn admit(&mut self, code: u8, throttled: bool, bypass: bool, now: Instant) -> bool {
        if throttled && !bypass {
            if let Some(last) = self.last_sent.get(&code) {
                if now.duration_since(*last) < MIN_EVENT_INTERVAL {
                    return false;
                }
            }
        }

        self.last_sent.insert(code, now);
        true
    }
}

/// Rate-limited event emission toward the host's input port.
///
/// One UDP socket, one task draining callers' events; timestamps are
/// monotonic nanoseconds from the sender's own epoch.
pub struct InputSender {
    socket: UdpSocket,
    throttle: Throttle,
    epoch: Instant,
    zoom_active: bool,
    buf: BytesMut,
}

impl InputSender {
    pub async fn connect(host: SocketAddr) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(host).await?;

        Ok(Self {
            socket,
            throttle: Throttle::new(),
            epoch: Instant::now(),
            zoom_active: false,
            buf: BytesMut::with_capacity(128),
        })
    }

    /// announce the registration over the input channel, on demand.
    ///
    /// The host learns this socket's current source mapping from the
    /// datagram itself, so re-announcing after a NAT rebind restores the
    /// input path without touching the control channel.
    pub async fn register(&mut self, listen_port: u16, user_id: &str) -> Result<(), std::io::Error> {
        self.send(InputEvent::Registration {
            listen_port,
            user_id: user_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// emit one event; returns whether it actually went out or fell to
    /// the throttle.
    pub async fn send(&mut self, event: InputEvent) -> Result<bool, std::io::Error> {
        let now = Instant::now();

        let bypass = match &event {
            InputEvent::ZoomRequest { active, .. } => {
                let transition = *active != self.zoom_active;
                self.zoom_active = *active;
                transition
            }
            _ => false,
        };

        if !self
            .throttle
            .admit(event.code(), event.is_throttled(), bypass, now)
        {
            return Ok(false);
        }

        let timestamp = now.duration_since(self.epoch).as_nanos() as u64;
        event.encode(timestamp, &mut self.buf);
        self.socket.send(&self.buf).await?;
        Ok(true)
    }
}
