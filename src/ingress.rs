//! HTTP routes peer archivers call. Handlers only forward to the reactor
//! through an [`ArchiverHandle`] and sign what comes back.

use std::convert::Infallible;
use std::sync::Arc;

use archivist_crypto::CryptoFacade;
use archivist_p2p::GossipAck;
use log::error;
use serde::Deserialize;
use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::archiver::ArchiverHandle;

/// Most records served by one `/cycleinfo` call.
pub const MAX_CYCLES_PER_REQUEST: u64 = 1000;
/// Widest `end - start` accepted by `/full-archive`.
pub const MAX_ARCHIVED_CYCLES_PER_REQUEST: u64 = 100;
const MAX_GOSSIP_BODY: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: u64,
    end: u64,
}

fn with_state<T: Clone + Send>(state: T) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn signed(crypto: &dyn CryptoFacade, body: Value) -> Response {
    match crypto.sign(body) {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => {
            error!("cannot sign response: {}", e);
            warp::reply::with_status(
                warp::reply::json(&json!({"error": "signing failed"})),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response()
        }
    }
}

fn unavailable() -> Response {
    warp::reply::with_status(
        warp::reply::json(&json!({"error": "archiver is shutting down"})),
        StatusCode::SERVICE_UNAVAILABLE,
    )
    .into_response()
}

async fn latest_cycles(
    count: u64,
    handle: ArchiverHandle,
    crypto: Arc<dyn CryptoFacade>,
) -> Result<Response, Infallible> {
    let count = count.clamp(1, MAX_CYCLES_PER_REQUEST) as usize;
    Ok(match handle.latest_cycles(count).await {
        Ok(records) => signed(crypto.as_ref(), json!({ "cycleInfo": records })),
        Err(_) => unavailable(),
    })
}

async fn cycle_range(
    query: RangeQuery,
    handle: ArchiverHandle,
    crypto: Arc<dyn CryptoFacade>,
) -> Result<Response, Infallible> {
    let end = query
        .end
        .min(query.start.saturating_add(MAX_CYCLES_PER_REQUEST - 1));
    Ok(match handle.cycle_range(query.start, end).await {
        Ok(records) => signed(crypto.as_ref(), json!({ "cycleInfo": records })),
        Err(_) => unavailable(),
    })
}

async fn node_list(handle: ArchiverHandle, crypto: Arc<dyn CryptoFacade>) -> Result<Response, Infallible> {
    Ok(match handle.node_list().await {
        Ok(nodes) => signed(crypto.as_ref(), json!({ "nodeList": nodes })),
        Err(_) => unavailable(),
    })
}

async fn archivers(handle: ArchiverHandle, crypto: Arc<dyn CryptoFacade>) -> Result<Response, Infallible> {
    Ok(match handle.archivers().await {
        Ok(up) => signed(crypto.as_ref(), json!({ "activeArchivers": up })),
        Err(_) => unavailable(),
    })
}

async fn full_archive(
    query: RangeQuery,
    handle: ArchiverHandle,
    crypto: Arc<dyn CryptoFacade>,
) -> Result<Response, Infallible> {
    if query.end < query.start || query.end - query.start > MAX_ARCHIVED_CYCLES_PER_REQUEST {
        let error = format!(
            "range must be ascending and span at most {} cycles",
            MAX_ARCHIVED_CYCLES_PER_REQUEST
        );
        return Ok(signed(crypto.as_ref(), json!({ "success": false, "error": error })));
    }
    Ok(match handle.full_archive(query.start, query.end).await {
        Ok(archived) => signed(crypto.as_ref(), json!({ "archivedCycles": archived })),
        Err(_) => unavailable(),
    })
}

async fn gossip_hashes(envelope: Value, handle: ArchiverHandle) -> Result<Response, Infallible> {
    let ack = match handle.gossip(envelope).await {
        Ok(Ok(())) => GossipAck {
            success: true,
            error: None,
        },
        Ok(Err(reason)) => GossipAck {
            success: false,
            error: Some(reason),
        },
        Err(_) => return Ok(unavailable()),
    };
    Ok(warp::reply::json(&ack).into_response())
}

/// `GET /cycleinfo/:count`, `GET /cycleinfo?start&end`, `GET /nodelist`,
/// `GET /archivers`, `GET /full-archive?start&end` and `POST /gossip-hashes`.
pub fn routes(
    handle: ArchiverHandle,
    crypto: Arc<dyn CryptoFacade>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let latest = warp::get()
        .and(warp::path!("cycleinfo" / u64))
        .and(with_state(handle.clone()))
        .and(with_state(crypto.clone()))
        .and_then(latest_cycles);

    let range = warp::get()
        .and(warp::path!("cycleinfo"))
        .and(warp::query::<RangeQuery>())
        .and(with_state(handle.clone()))
        .and(with_state(crypto.clone()))
        .and_then(cycle_range);

    let nodes = warp::get()
        .and(warp::path!("nodelist"))
        .and(with_state(handle.clone()))
        .and(with_state(crypto.clone()))
        .and_then(node_list);

    let peers = warp::get()
        .and(warp::path!("archivers"))
        .and(with_state(handle.clone()))
        .and(with_state(crypto.clone()))
        .and_then(archivers);

    let archive = warp::get()
        .and(warp::path!("full-archive"))
        .and(warp::query::<RangeQuery>())
        .and(with_state(handle.clone()))
        .and(with_state(crypto))
        .and_then(full_archive);

    let gossip = warp::post()
        .and(warp::path!("gossip-hashes"))
        .and(warp::body::content_length_limit(MAX_GOSSIP_BODY))
        .and(warp::body::json())
        .and(with_state(handle))
        .and_then(gossip_hashes);

    latest
        .or(range)
        .unify()
        .or(nodes)
        .unify()
        .or(peers)
        .unify()
        .or(archive)
        .unify()
        .or(gossip)
        .unify()
        .with(warp::log("archivist::ingress"))
}
