//! The relay pipeline: ingress reads client queries, processors validate
//! and forward them under a fresh transaction ID, egress correlates
//! upstream replies back to their clients, and the sweeper culls requests
//! whose reply never came. All four share the correlator and two sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::config::{ServerSettings, MAX_PACKET_SIZE, RECV_BUFFER_SIZE, SOCKET_BUFFER_SIZE};
use crate::correlator::{Correlator, CorrelatorError, Request};
use crate::proto_utils::{self, HEADER_LEN};
use crate::stats::Stats;

pub struct Engine {
    settings: ServerSettings,
    client_socket: Arc<UdpSocket>,
    upstream_socket: Arc<UdpSocket>,
    correlator: Arc<Correlator>,
    cache: Option<Arc<ResponseCache>>,
    stats: Arc<Stats>,
}

/// Everything a processor or egress worker touches, cheap to clone.
#[derive(Clone)]
struct StageContext {
    client_socket: Arc<UdpSocket>,
    upstream_socket: Arc<UdpSocket>,
    upstream_addr: SocketAddr,
    correlator: Arc<Correlator>,
    cache: Option<Arc<ResponseCache>>,
    stats: Arc<Stats>,
}

impl Engine {
    /// Bind both sockets. The client socket listens on the configured
    /// address; the upstream socket takes an ephemeral port in the same
    /// address family as the resolver.
    pub fn bind(settings: ServerSettings) -> anyhow::Result<Self> {
        let client_socket = bind_udp_socket(settings.listen_addr)
            .with_context(|| format!("listen on {}", settings.listen_addr))?;

        let ephemeral: SocketAddr = if settings.upstream_addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr")
        } else {
            "[::]:0".parse().expect("static addr")
        };
        let upstream_socket =
            bind_udp_socket(ephemeral).context("bind upstream-facing socket")?;

        let correlator = Arc::new(Correlator::new(settings.request_timeout));
        let cache = settings.cache.then(|| Arc::new(ResponseCache::new()));

        Ok(Self {
            settings,
            client_socket: Arc::new(client_socket),
            upstream_socket: Arc::new(upstream_socket),
            correlator,
            cache,
            stats: Arc::new(Stats::new()),
        })
    }

    #[allow(dead_code)]
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.client_socket.local_addr()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[allow(dead_code)]
    pub fn in_flight(&self) -> usize {
        self.correlator.in_flight()
    }

    /// Run all stages until `shutdown` is cancelled. Every stage loop
    /// selects its blocking receive against cancellation, so the whole
    /// pipeline unwinds within one poll of the signal; in-flight requests
    /// are dropped without a flush.
    pub async fn run(&self, shutdown: CancellationToken) {
        let (ingress_tx, ingress_rx) = flume::unbounded::<Request>();

        let ctx = StageContext {
            client_socket: Arc::clone(&self.client_socket),
            upstream_socket: Arc::clone(&self.upstream_socket),
            upstream_addr: self.settings.upstream_addr,
            correlator: Arc::clone(&self.correlator),
            cache: self.cache.clone(),
            stats: Arc::clone(&self.stats),
        };

        let mut stages = JoinSet::new();

        stages.spawn(run_ingress(
            Arc::clone(&self.client_socket),
            ingress_tx,
            Arc::clone(&self.stats),
            shutdown.clone(),
        ));

        for worker_id in 0..self.settings.processors.max(1) {
            stages.spawn(run_processor(
                worker_id,
                ctx.clone(),
                ingress_rx.clone(),
                shutdown.clone(),
            ));
        }
        drop(ingress_rx);

        stages.spawn(run_egress(ctx.clone(), shutdown.clone()));

        stages.spawn(run_sweeper(
            Arc::clone(&self.correlator),
            Arc::clone(&self.stats),
            self.settings.scan_interval,
            shutdown,
        ));

        while stages.join_next().await.is_some() {}
    }
}

fn bind_udp_socket(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    if let Err(err) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(error = %err, "failed to set udp recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(error = %err, "failed to set udp send buffer size");
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    UdpSocket::from_std(socket.into()).context("register socket with runtime")
}

/// Ingress: tight read loop on the client socket. No parsing happens here;
/// a copied datagram goes straight onto the queue so the reader can get
/// back to `recv_from`.
async fn run_ingress(
    socket: Arc<UdpSocket>,
    queue: flume::Sender<Request>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        let recv = tokio::select! {
            _ = shutdown.cancelled() => break,
            recv = socket.recv_from(&mut buf) => recv,
        };
        let (len, src) = match recv {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "client recv error");
                continue;
            }
        };

        if len > MAX_PACKET_SIZE {
            warn!(client = %src, bytes = len, "oversized datagram discarded");
            Stats::inc(&stats.dropped_oversize);
            continue;
        }

        Stats::inc(&stats.packets_in);
        if queue.send(Request::new(buf[..len].to_vec(), src)).is_err() {
            // All processors are gone; nothing left to feed.
            break;
        }
    }
}

/// Processor: validate a queued query, serve it from the cache when
/// possible, otherwise file it under a fresh proxy ID and forward it.
async fn run_processor(
    worker_id: usize,
    ctx: StageContext,
    queue: flume::Receiver<Request>,
    shutdown: CancellationToken,
) {
    debug!(worker_id, "processor started");

    loop {
        let req = tokio::select! {
            _ = shutdown.cancelled() => break,
            recv = queue.recv_async() => match recv {
                Ok(req) => req,
                Err(_) => break,
            },
        };
        handle_query(&ctx, req).await;
    }
}

async fn handle_query(ctx: &StageContext, mut req: Request) {
    let header = match proto_utils::decode_header(&req.raw) {
        Ok(header) => header,
        Err(err) => {
            debug!(client = %req.client_addr, error = %err, "undecodable query dropped");
            Stats::inc(&ctx.stats.dropped_malformed);
            return;
        }
    };
    if header.qdcount == 0 {
        debug!(client = %req.client_addr, "query without question section dropped");
        Stats::inc(&ctx.stats.dropped_malformed);
        return;
    }
    let question = match proto_utils::decode_question(&req.raw, HEADER_LEN) {
        Ok((question, _)) => question,
        Err(err) => {
            debug!(client = %req.client_addr, error = %err, "undecodable question dropped");
            Stats::inc(&ctx.stats.dropped_malformed);
            return;
        }
    };
    if header.qr {
        // Only questions belong on the client socket.
        warn!(client = %req.client_addr, id = header.id, "response packet on client socket, ignoring");
        Stats::inc(&ctx.stats.dropped_unexpected_qr);
        return;
    }

    Stats::inc(&ctx.stats.requests);
    req.client_id = header.id;
    req.qname = question.qname;
    req.qtype = question.qtype;
    req.qclass = question.qclass;

    if let Some(cache) = &ctx.cache {
        if let Some(template) = cache.lookup(&req.qname, req.qtype, req.qclass) {
            let mut response = template.to_vec();
            proto_utils::write_id(&mut response, req.client_id);
            match ctx.client_socket.send_to(&response, req.client_addr).await {
                Ok(_) => {
                    Stats::inc(&ctx.stats.served);
                    Stats::inc(&ctx.stats.packets_out);
                    debug!(qname = %req.qname, client = %req.client_addr, "served from cache");
                }
                Err(err) => {
                    warn!(error = %err, client = %req.client_addr, "send to client failed");
                    Stats::inc(&ctx.stats.dropped_send_failed);
                }
            }
            return;
        }
    }

    let qname = req.qname.clone();
    let client_id = req.client_id;
    let mut wire = req.raw.clone();

    // Install strictly before the send: a fast reply must find the slot.
    let proxy_id = match ctx.correlator.install(req) {
        Ok(id) => id,
        Err(CorrelatorError::NoIdAvailable) => {
            warn!(qname = %qname, "transaction id space exhausted, query dropped");
            Stats::inc(&ctx.stats.dropped_no_id);
            return;
        }
    };
    proto_utils::write_id(&mut wire, proxy_id);

    match ctx.upstream_socket.send_to(&wire, ctx.upstream_addr).await {
        Ok(_) => {
            Stats::inc(&ctx.stats.packets_out);
            debug!(qname = %qname, client_id, proxy_id, "forwarded to upstream");
        }
        Err(err) => {
            // Reclaim the slot so the id does not leak.
            ctx.correlator.take_by_id(proxy_id);
            warn!(error = %err, qname = %qname, "send to upstream failed");
            Stats::inc(&ctx.stats.dropped_send_failed);
        }
    }
}

/// Egress: read upstream replies, match them to the pending request by the
/// proxy ID in their first two bytes, restore the client's ID and deliver.
async fn run_egress(ctx: StageContext, shutdown: CancellationToken) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        let recv = tokio::select! {
            _ = shutdown.cancelled() => break,
            recv = ctx.upstream_socket.recv_from(&mut buf) => recv,
        };
        let (len, src) = match recv {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "upstream recv error");
                continue;
            }
        };

        if len > MAX_PACKET_SIZE {
            warn!(source = %src, bytes = len, "oversized datagram discarded");
            Stats::inc(&ctx.stats.dropped_oversize);
            continue;
        }

        // The one adversary check: anything not from the configured
        // upstream address and port is spoofed or misdirected.
        if src != ctx.upstream_addr {
            warn!(source = %src, expected = %ctx.upstream_addr, "reply from unexpected source, ignoring");
            Stats::inc(&ctx.stats.dropped_foreign);
            continue;
        }

        let raw = &mut buf[..len];
        let Some(proxy_id) = proto_utils::read_id(raw) else {
            Stats::inc(&ctx.stats.dropped_malformed);
            continue;
        };
        let header = match proto_utils::decode_header(raw) {
            Ok(header) => header,
            Err(err) => {
                debug!(error = %err, "undecodable reply dropped");
                Stats::inc(&ctx.stats.dropped_malformed);
                continue;
            }
        };
        if !header.qr {
            warn!(proxy_id, "question packet on upstream socket, ignoring");
            Stats::inc(&ctx.stats.dropped_unexpected_qr);
            continue;
        }
        Stats::inc(&ctx.stats.packets_in);

        let Some(req) = ctx.correlator.take_by_id(proxy_id) else {
            // Timed out and already culled, or never ours. Normal case.
            debug!(proxy_id, "reply without a pending request");
            continue;
        };

        let elapsed = req.age(Instant::now());
        if elapsed >= ctx.correlator.request_timeout() {
            Stats::inc(&ctx.stats.time_outs);
            debug!(
                qname = %req.qname,
                elapsed_ms = elapsed.as_millis() as u64,
                "timeout (passive)"
            );
            continue;
        }

        proto_utils::write_id(raw, req.client_id);
        match ctx.client_socket.send_to(raw, req.client_addr).await {
            Ok(_) => {
                Stats::inc(&ctx.stats.served);
                Stats::inc(&ctx.stats.packets_out);
                debug!(
                    qname = %req.qname,
                    client = %req.client_addr,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "reply delivered"
                );
            }
            Err(err) => {
                warn!(error = %err, client = %req.client_addr, "send to client failed");
                Stats::inc(&ctx.stats.dropped_send_failed);
                continue;
            }
        }

        if let Some(cache) = &ctx.cache {
            cache.publish(&req.qname, req.qtype, req.qclass, raw);
        }
    }
}

/// Sweeper: periodic active cull of requests whose reply never came, so
/// slots free up without waiting for an ID-wrap collision.
async fn run_sweeper(
    correlator: Arc<Correlator>,
    stats: Arc<Stats>,
    scan_interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = correlator.sweep(Instant::now());
                if removed > 0 {
                    Stats::add(&stats.time_outs, removed as u64);
                    debug!(removed, in_flight = correlator.in_flight(), "sweep culled timed out requests");
                }
            }
        }
    }
}
