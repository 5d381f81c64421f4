use crate::proto;
use crate::transport::service::SyncService;
use prost::Message;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Accepts sync connections and feeds decoded frames to the service
///
/// Each connection carries length-prefixed protobuf request/response
/// frames and may issue any number of requests before closing.
pub struct SyncListener {
    service: Arc<SyncService>,
}

impl SyncListener {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }

    pub async fn run(&self, bind_addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("Sync listener on {}", bind_addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Sync connection from {}", peer);
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, service).await {
                    debug!("Sync connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    service: Arc<SyncService>,
) -> std::io::Result<()> {
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len,
            Err(_) => return Ok(()), // peer closed
        };
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;

        let request = match proto::SyncRequest::decode(&body[..]) {
            Ok(request) => request,
            Err(e) => {
                error!("Undecodable sync request: {}", e);
                return Ok(());
            }
        };

        let response = service.handle(request).await;
        let body = response.encode_to_vec();
        stream.write_u32(body.len() as u32).await?;
        stream.write_all(&body).await?;
        stream.flush().await?;
    }
}
