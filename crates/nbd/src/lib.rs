//! NBD export server.
//!
//! Every version is exported as an NBD device named by its uid.  Reads go
//! through the same verified path as restore, with decoded blocks held in a
//! bounded directory-backed cache.  Writes on a read-write export land in a
//! per-connection copy-on-write store; at disconnect the dirty set is
//! fixated into a new protected version.
//!
//! The protocol has no authentication and no transport encryption, so the
//! server binds to loopback unless explicitly told otherwise (and warns
//! when it is).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use benji_common::{Version, VersionUid};
use benji_engine::Engine;
use benji_storage::cache::{ReadCache, ReadCacheConfig};

pub mod cow;
pub mod proto;

mod error;

pub use error::NbdError;

use cow::CowStore;
use proto::Request;

pub struct NbdServer {
    engine: Arc<Engine>,
    read_only: bool,
    cache: Arc<ReadCache>,
}

struct Export {
    version: Version,
}

impl NbdServer {
    pub fn new(engine: Arc<Engine>, read_only: bool) -> Result<Arc<Self>, NbdError> {
        let nbd_config = &engine.config().nbd;
        let cache = ReadCache::open(&ReadCacheConfig {
            directory: nbd_config.cache_directory.clone(),
            maximum_size: nbd_config.cache_maximum_size,
            shards: 16,
        })?;
        Ok(Arc::new(Self {
            engine,
            read_only,
            cache: Arc::new(cache),
        }))
    }

    /// Accept loop; one task per connection.
    pub async fn serve(self: Arc<Self>) -> Result<(), NbdError> {
        let address: SocketAddr = self
            .engine
            .config()
            .nbd
            .bind_address
            .parse()
            .map_err(|_| {
                NbdError::protocol(format!(
                    "invalid nbd bind address {:?}",
                    self.engine.config().nbd.bind_address
                ))
            })?;
        if !address.ip().is_loopback() {
            warn!(%address, "NBD has no auth or encryption; binding beyond loopback");
        }

        let listener = TcpListener::bind(address).await?;
        info!(%address, read_only = self.read_only, "NBD server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                info!(%peer, "NBD client connected");
                match server.handle_connection(stream).await {
                    Ok(()) => info!(%peer, "NBD client finished"),
                    Err(err) if err.is_disconnect() => {
                        info!(%peer, "NBD client disconnected")
                    }
                    Err(err) => error!(%peer, error = %err, "NBD connection failed"),
                }
            });
        }
    }

    /// Drive one connection through negotiation and transmission.  Public
    /// so tests can run it over an in-memory stream.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let negotiation_budget = std::time::Duration::from_secs(
            self.engine.config().nbd.negotiation_timeout_seconds.max(1),
        );
        let negotiated = tokio::time::timeout(negotiation_budget, async {
            let client_flags = proto::server_handshake(&mut stream).await?;
            let no_zeroes = client_flags & proto::FLAG_NO_ZEROES != 0;
            self.negotiate(&mut stream, no_zeroes).await
        })
        .await;

        let export = match negotiated {
            Ok(Ok(Some(export))) => export,
            // ABORT, or a client that vanished after negotiation started.
            // Some clients probe and reconnect; that must not be an error.
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(err)) if err.is_disconnect() => return Ok(()),
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => {
                warn!("negotiation stalled, abandoning connection");
                return Ok(());
            }
        };

        let mut cow: Option<Arc<CowStore>> = None;
        let result = self.transmission(&mut stream, &export, &mut cow).await;
        match result {
            Ok(()) => {
                self.finish_cow(&export.version, cow.take()).await;
                Ok(())
            }
            Err(err) if err.is_disconnect() => {
                // The client went away without DISC; dirtied writes are
                // still fixated rather than silently dropped.
                self.finish_cow(&export.version, cow.take()).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn negotiate<S>(
        &self,
        stream: &mut S,
        no_zeroes: bool,
    ) -> Result<Option<Export>, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let (option, data) = proto::read_option(stream).await?;
            match option {
                proto::OPT_LIST => {
                    let versions = self.blocking_versions().await?;
                    for version in versions {
                        let name = version.uid.as_str().as_bytes();
                        let mut payload = Vec::with_capacity(4 + name.len());
                        payload.extend((name.len() as u32).to_be_bytes());
                        payload.extend(name);
                        proto::write_option_reply(stream, option, proto::REP_SERVER, &payload)
                            .await?;
                    }
                    proto::write_option_reply(stream, option, proto::REP_ACK, &[]).await?;
                }
                proto::OPT_ABORT => {
                    proto::write_option_reply(stream, option, proto::REP_ACK, &[]).await?;
                    return Ok(None);
                }
                proto::OPT_EXPORT_NAME => {
                    let name = String::from_utf8(data)
                        .map_err(|_| NbdError::protocol("export name is not UTF-8"))?;
                    let version = self.blocking_version(VersionUid::new(name.as_str())).await?;

                    let mut flags = proto::TRANSMISSION_HAS_FLAGS | proto::TRANSMISSION_SEND_FLUSH;
                    if self.read_only {
                        flags |= proto::TRANSMISSION_READ_ONLY;
                    }
                    proto::write_export_info(stream, version.size, flags, no_zeroes).await?;
                    info!(export = %version.uid, read_only = self.read_only, "export negotiated");
                    return Ok(Some(Export { version }));
                }
                other => {
                    warn!(option = other, "unsupported NBD option");
                    proto::write_option_reply(stream, other, proto::REP_ERR_UNSUP, &[]).await?;
                }
            }
        }
    }

    async fn transmission<S>(
        &self,
        stream: &mut S,
        export: &Export,
        cow: &mut Option<Arc<CowStore>>,
    ) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let request = proto::read_request(stream).await?;
            match request.command {
                proto::CMD_READ => {
                    if request.offset + request.length as u64 > export.version.size {
                        proto::write_simple_reply(stream, proto::EINVAL, request.handle, &[])
                            .await?;
                        continue;
                    }
                    match self.read_range(export, cow.as_ref(), &request).await {
                        Ok(data) => {
                            proto::write_simple_reply(stream, 0, request.handle, &data).await?
                        }
                        Err(err) => {
                            error!(offset = request.offset, length = request.length, error = %err, "read failed");
                            proto::write_simple_reply(stream, proto::EIO, request.handle, &[])
                                .await?;
                        }
                    }
                }
                proto::CMD_WRITE => {
                    let mut data = vec![0u8; request.length as usize];
                    stream.read_exact(&mut data).await?;

                    if self.read_only {
                        proto::write_simple_reply(stream, proto::EPERM, request.handle, &[])
                            .await?;
                        continue;
                    }
                    if request.offset + request.length as u64 > export.version.size {
                        proto::write_simple_reply(stream, proto::EINVAL, request.handle, &[])
                            .await?;
                        continue;
                    }

                    if cow.is_none() {
                        let store = CowStore::create(
                            &self.engine.config().nbd.cache_directory,
                            &export.version.uid,
                        )?;
                        *cow = Some(Arc::new(store));
                    }
                    let store = Arc::clone(cow.as_ref().expect("created above"));
                    let result = self.write_range(export, &store, &request, data).await;
                    match result {
                        Ok(()) => {
                            proto::write_simple_reply(stream, 0, request.handle, &[]).await?
                        }
                        Err(err) => {
                            error!(offset = request.offset, error = %err, "write failed");
                            proto::write_simple_reply(stream, proto::EIO, request.handle, &[])
                                .await?;
                        }
                    }
                }
                proto::CMD_FLUSH => {
                    let error = match &*cow {
                        Some(store) => {
                            let store = Arc::clone(store);
                            let flushed =
                                tokio::task::spawn_blocking(move || store.sync()).await;
                            match flushed {
                                Ok(Ok(())) => 0,
                                _ => proto::EIO,
                            }
                        }
                        None => 0,
                    };
                    proto::write_simple_reply(stream, error, request.handle, &[]).await?;
                }
                proto::CMD_DISC => {
                    self.finish_cow(&export.version, cow.take()).await;
                    return Ok(());
                }
                other => {
                    warn!(command = other, "unsupported NBD command");
                    proto::write_simple_reply(stream, proto::EINVAL, request.handle, &[]).await?;
                }
            }
        }
    }

    /// Assemble a read reply from whole blocks (COW content wins, then the
    /// decoded-block cache, then the verified storage path).
    async fn read_range(
        &self,
        export: &Export,
        cow: Option<&Arc<CowStore>>,
        request: &Request,
    ) -> Result<Vec<u8>, NbdError> {
        let block_size = export.version.block_size as u64;
        let mut assembled = Vec::with_capacity(request.length as usize);
        let mut remaining = request.length as u64;
        let mut offset = request.offset;

        while remaining > 0 {
            let idx = offset / block_size;
            let within = (offset % block_size) as usize;
            let content = self.block_content(&export.version, cow, idx).await?;
            let take = remaining.min(content.len() as u64 - within as u64) as usize;
            assembled.extend_from_slice(&content[within..within + take]);
            offset += take as u64;
            remaining -= take as u64;
        }
        Ok(assembled)
    }

    /// Apply one write request block-by-block into the COW store.
    async fn write_range(
        &self,
        export: &Export,
        cow: &Arc<CowStore>,
        request: &Request,
        data: Vec<u8>,
    ) -> Result<(), NbdError> {
        let block_size = export.version.block_size as u64;
        let mut patches: BTreeMap<u64, Vec<(usize, Vec<u8>)>> = BTreeMap::new();

        let mut consumed = 0usize;
        let mut offset = request.offset;
        while consumed < data.len() {
            let idx = offset / block_size;
            let within = (offset % block_size) as usize;
            let block_length = block_length_at(&export.version, idx);
            let take = (data.len() - consumed).min(block_length - within);
            patches
                .entry(idx)
                .or_default()
                .push((within, data[consumed..consumed + take].to_vec()));
            consumed += take;
            offset += take as u64;
        }

        for (idx, edits) in patches {
            let mut content = self.block_content(&export.version, Some(cow), idx).await?;
            for (within, bytes) in edits {
                content[within..within + bytes.len()].copy_from_slice(&bytes);
            }
            let cow = Arc::clone(cow);
            tokio::task::spawn_blocking(move || cow.write_block(idx, &content))
                .await
                .map_err(|_| NbdError::protocol("COW writer task panicked"))??;
        }
        Ok(())
    }

    /// Full current content of one block.
    async fn block_content(
        &self,
        version: &Version,
        cow: Option<&Arc<CowStore>>,
        idx: u64,
    ) -> Result<Vec<u8>, NbdError> {
        if let Some(cow) = cow {
            let cow = Arc::clone(cow);
            let dirty =
                tokio::task::spawn_blocking(move || cow.read_block(idx))
                    .await
                    .map_err(|_| NbdError::protocol("COW reader task panicked"))??;
            if let Some(content) = dirty {
                return Ok(content);
            }
        }

        let engine = Arc::clone(&self.engine);
        let cache = Arc::clone(&self.cache);
        let version = version.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, NbdError> {
            let block = engine.meta().block(&version.uid, idx).map_err(|err| {
                NbdError::Engine(err.into())
            })?;
            let Some(block_uid) = block.uid else {
                return Ok(vec![0u8; block.size as usize]);
            };
            let cache_key = block_uid.object_key();
            if let Some(hit) = cache.get(&cache_key) {
                return Ok(hit);
            }
            let data = engine.read_block_verified(&version, &block)?;
            cache.put(&cache_key, &data);
            Ok(data)
        })
        .await
        .map_err(|_| NbdError::protocol("block reader task panicked"))?
    }

    /// DISC or disconnect with a live COW store: fixate the dirty set.
    /// Fixation runs the full storage write path, so it goes to a blocking
    /// thread.
    async fn finish_cow(&self, version: &Version, cow: Option<Arc<CowStore>>) {
        let Some(cow) = cow else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        let version = version.clone();
        let finished =
            tokio::task::spawn_blocking(move || fixate_session(engine, version, cow)).await;
        if finished.is_err() {
            error!("COW fixation task panicked");
        }
    }

    async fn blocking_versions(&self) -> Result<Vec<Version>, NbdError> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.ls(None))
            .await
            .map_err(|_| NbdError::protocol("listing task panicked"))?
            .map_err(NbdError::Engine)
    }

    async fn blocking_version(&self, uid: VersionUid) -> Result<Version, NbdError> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.meta().version(&uid))
            .await
            .map_err(|_| NbdError::protocol("version lookup task panicked"))?
            .map_err(|err| NbdError::Engine(err.into()))
    }
}

fn fixate_session(engine: Arc<Engine>, version: Version, cow: Arc<CowStore>) {
    if !cow.is_dirty() {
        if let Ok(cow) = Arc::try_unwrap(cow) {
            cow.discard();
        }
        return;
    }

    let dirty = cow.dirty_indices();
    let result = engine.fixate_cow_version(&version.uid, &dirty, &|idx| {
        cow.read_block(idx)?.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("block {idx} not dirty"))
        })
    });
    match result {
        Ok(fixated) => {
            info!(original = %version.uid, fixated = %fixated.uid, "COW writes fixated");
            if let Ok(cow) = Arc::try_unwrap(cow) {
                cow.discard();
            }
        }
        Err(err) => {
            // Keep the COW directory for manual recovery.
            error!(original = %version.uid, error = %err, "COW fixation failed");
        }
    }
}

fn block_length_at(version: &Version, idx: u64) -> usize {
    let block_size = version.block_size as u64;
    let offset = idx * block_size;
    (version.size - offset).min(block_size) as usize
}
