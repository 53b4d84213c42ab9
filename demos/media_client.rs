//! A product service reading media metadata through a resilient client.
//!
//! Reads fall back to a placeholder image; uploads and removals re-raise, because inventing a
//! successful write would leave the product pointing at media that does not exist.
//!
//! Run with `cargo run --example media_client`.

use async_trait::async_trait;
use peercall::{
    fallback, Backoff, BreakerConfig, CallFailure, ClientError, LogSink, RetryConfig,
    ServiceClient, TargetConfig, Transport, TransportFailure,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Media {
    id: u64,
    name: String,
    url: String,
}

impl Media {
    fn placeholder() -> Self {
        Self { id: 0, name: "placeholder".into(), url: "/static/no-image.png".into() }
    }
}

#[derive(Debug, Clone)]
enum MediaRequest {
    Get { id: u64 },
    Save { name: String, bytes: Vec<u8> },
    Remove { id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
enum MediaResponse {
    Media(Media),
    Removed,
}

/// In-process stand-in for the media service.
#[derive(Debug, Default)]
struct SimulatedMediaService {
    down: AtomicBool,
    next_id: AtomicU64,
}

#[async_trait]
impl Transport for SimulatedMediaService {
    type Request = MediaRequest;
    type Response = MediaResponse;

    async fn perform(
        &self,
        operation: &str,
        args: &MediaRequest,
        _timeout: Duration,
    ) -> Result<MediaResponse, TransportFailure> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportFailure::from_status(503, format!("{operation}: media service unavailable")));
        }
        match args {
            MediaRequest::Get { id } if *id >= 1000 => {
                Err(TransportFailure::from_status(404, format!("media {id} not found")))
            }
            MediaRequest::Get { id } => Ok(MediaResponse::Media(Media {
                id: *id,
                name: format!("media-{id}"),
                url: format!("https://cdn.example.com/media/{id}.jpg"),
            })),
            MediaRequest::Save { name, bytes } if bytes.is_empty() => {
                Err(TransportFailure::from_status(400, format!("{name}: empty upload")))
            }
            MediaRequest::Save { name, .. } => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(MediaResponse::Media(Media {
                    id,
                    name: name.clone(),
                    url: format!("https://cdn.example.com/media/{id}.jpg"),
                }))
            }
            MediaRequest::Remove { .. } => Ok(MediaResponse::Removed),
        }
    }
}

/// Typed facade the product service uses.
struct MediaClient {
    inner: ServiceClient<SimulatedMediaService>,
}

impl MediaClient {
    fn new(service: SimulatedMediaService) -> Result<Self, Box<dyn std::error::Error>> {
        let config = TargetConfig {
            breaker: BreakerConfig::new(6, 0.5, Duration::from_millis(300), 2)?,
            retry: RetryConfig::new(
                3,
                Backoff::linear(Duration::from_millis(20)),
                Duration::from_millis(500),
            )?,
            base_url: Some(String::from("http://media.internal/media")),
        };
        let inner = ServiceClient::builder("media", service)
            .config(config)
            .telemetry(LogSink)
            .fallback("get_media", |_req: &MediaRequest, cause: &CallFailure| {
                tracing::info!(cause = cause.label(), "serving placeholder media");
                Ok(MediaResponse::Media(Media::placeholder()))
            })
            .fallback("save_file", fallback::reraise())
            .fallback("remove_media", fallback::reraise())
            .build()?;
        Ok(Self { inner })
    }

    async fn get_media(&self, id: Option<u64>) -> Result<Media, ClientError> {
        // products without media never reach the network
        let Some(id) = id else {
            return Ok(Media::placeholder());
        };
        match self.inner.invoke("get_media", &MediaRequest::Get { id }).await?.into_inner() {
            MediaResponse::Media(media) => Ok(media),
            MediaResponse::Removed => Ok(Media::placeholder()),
        }
    }

    async fn save_file(&self, name: &str, bytes: Vec<u8>) -> Result<Media, ClientError> {
        let request = MediaRequest::Save { name: name.to_string(), bytes };
        match self.inner.invoke("save_file", &request).await?.into_inner() {
            MediaResponse::Media(media) => Ok(media),
            MediaResponse::Removed => Ok(Media::placeholder()),
        }
    }

    async fn remove_media(&self, id: u64) -> Result<(), ClientError> {
        self.inner.invoke("remove_media", &MediaRequest::Remove { id }).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let client = MediaClient::new(SimulatedMediaService::default())?;

    println!("--- healthy ---");
    println!("{:?}", client.get_media(Some(7)).await?);
    println!("{:?}", client.get_media(None).await?);
    println!("{:?}", client.save_file("banner.png", vec![1, 2, 3]).await?);
    match client.save_file("empty.png", Vec::new()).await {
        Err(err) => println!("upload rejected: {err}"),
        Ok(media) => println!("unexpected upload: {media:?}"),
    }
    println!("missing media -> {:?}", client.get_media(Some(4242)).await?);

    println!("--- media service down ---");
    client.inner.transport().down.store(true, Ordering::SeqCst);
    for id in 1..=3 {
        println!("get {id} -> {:?}", client.get_media(Some(id)).await?);
    }
    println!("breaker: {}", client.inner.state());
    if let Err(err) = client.remove_media(3).await {
        println!("remove failed: {err}");
    }

    println!("--- recovery ---");
    client.inner.transport().down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(350)).await;
    for id in 10..=11 {
        println!("get {id} -> {:?}", client.get_media(Some(id)).await?);
    }
    println!("breaker: {}", client.inner.state());
    println!("registry: {:?}", client.inner.registry().snapshot());
    Ok(())
}
