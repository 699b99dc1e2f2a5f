use crate::{DRef, FRef, LocalId, PoolError, PoolResult, WorkerId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Options accepted by `put`, locally or forwarded to a remote owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutOptions {
    /// Worker that should own the value. None means the calling worker.
    pub owner: Option<WorkerId>,
    /// Advertised byte footprint. None means the payload length.
    pub size: Option<u64>,
    pub destroy_on_evict: bool,
    /// Known on-disk copy of the payload, recorded as the canonical file.
    pub file: Option<PathBuf>,
}

/// The payload envelope for a remote dereference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchReply {
    /// Payload served straight from the owner's memory.
    Payload(Bytes),
    /// The owner keeps the value spilled on disk; the caller fetches the
    /// bytes itself through the file reference and the locality resolver.
    Spilled(FRef),
}

/// Error kinds that survive a trip over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    MissingRef,
    Transport,
    Io,
    Precondition,
    InvalidParam,
    Decode,
    Internal,
}

/// Wire form of a [`PoolError`]. Peers re-raise the matching error kind so
/// callers cannot tell a remote miss from a local one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFault {
    pub kind: FaultKind,
    pub message: String,
}

impl From<PoolError> for RpcFault {
    fn from(err: PoolError) -> Self {
        let (kind, message) = match err {
            PoolError::MissingRef(m) => (FaultKind::MissingRef, m),
            PoolError::Transport(m) => (FaultKind::Transport, m),
            PoolError::IoError(m) => (FaultKind::Io, m),
            PoolError::Precondition(m) => (FaultKind::Precondition, m),
            PoolError::InvalidParam(m) => (FaultKind::InvalidParam, m),
            PoolError::DecodeError(m) => (FaultKind::Decode, m),
            PoolError::Internal(m) => (FaultKind::Internal, m),
        };
        Self { kind, message }
    }
}

impl From<RpcFault> for PoolError {
    fn from(fault: RpcFault) -> Self {
        match fault.kind {
            FaultKind::MissingRef => PoolError::MissingRef(fault.message),
            FaultKind::Transport => PoolError::Transport(fault.message),
            FaultKind::Io => PoolError::IoError(fault.message),
            FaultKind::Precondition => PoolError::Precondition(fault.message),
            FaultKind::InvalidParam => PoolError::InvalidParam(fault.message),
            FaultKind::Decode => PoolError::DecodeError(fault.message),
            FaultKind::Internal => PoolError::Internal(fault.message),
        }
    }
}

pub type RpcResult<T> = Result<T, RpcFault>;

/// Endpoints every worker serves to its peers.
///
/// `ref_at_owner` and `unref_at_owner` are fire-and-forget on the sending
/// side; the remaining calls block the caller until the peer answers.
#[async_trait]
pub trait PoolService: Send + Sync {
    async fn ref_at_owner(&self, dref: DRef) -> RpcResult<()>;
    async fn unref_at_owner(&self, dref: DRef) -> RpcResult<()>;

    /// Owner-side dereference for a remote caller. Spilled values come back
    /// as an [`FRef`] instead of being re-materialized on the owner.
    async fn get_local(&self, id: LocalId) -> RpcResult<FetchReply>;

    /// Read a payload file living on this worker's disk.
    async fn read_file(&self, file: PathBuf) -> RpcResult<Bytes>;

    async fn put(&self, data: Bytes, opts: PutOptions) -> RpcResult<DRef>;

    async fn move_to_disk(
        &self,
        dref: DRef,
        path: Option<PathBuf>,
        keep_in_memory: bool,
    ) -> RpcResult<FRef>;
    async fn save_to_disk(&self, dref: DRef, path: PathBuf) -> RpcResult<FRef>;
    async fn delete_from_disk(&self, dref: DRef, path: Option<PathBuf>) -> RpcResult<()>;
    async fn set_destroy_on_evict(&self, dref: DRef, flag: bool) -> RpcResult<()>;

    /// Destroy a ref regardless of its population count.
    async fn delete(&self, dref: DRef) -> RpcResult<()>;
    /// Remove a payload file living on this worker's disk.
    async fn delete_file(&self, file: PathBuf) -> RpcResult<()>;

    /// Topology query, answered by the coordinator from its peer table.
    async fn get_wrkrips(&self) -> RpcResult<HashMap<Ipv4Addr, Vec<WorkerId>>>;
    /// The IP this worker is actually reachable at, for loopback merging.
    async fn external_ip(&self) -> RpcResult<Ipv4Addr>;

    /// Coordinator-side registry note: `dref` was created from `file`.
    async fn record_read(&self, file: PathBuf, dref: DRef) -> RpcResult<()>;
}

/// Client view of the peer endpoints, addressed by worker id.
///
/// Implementations route each call to the target's [`PoolService`] and map
/// delivery failures to [`PoolError::Transport`]. The pool never retries a
/// failed ref or unref notice.
#[async_trait]
pub trait PoolRpc: Send + Sync {
    async fn ref_at_owner(&self, target: WorkerId, dref: DRef) -> PoolResult<()>;
    async fn unref_at_owner(&self, target: WorkerId, dref: DRef) -> PoolResult<()>;
    async fn get_local(&self, target: WorkerId, id: LocalId) -> PoolResult<FetchReply>;
    async fn read_file(&self, target: WorkerId, file: PathBuf) -> PoolResult<Bytes>;
    async fn put(&self, target: WorkerId, data: Bytes, opts: PutOptions) -> PoolResult<DRef>;
    async fn move_to_disk(
        &self,
        target: WorkerId,
        dref: DRef,
        path: Option<PathBuf>,
        keep_in_memory: bool,
    ) -> PoolResult<FRef>;
    async fn save_to_disk(&self, target: WorkerId, dref: DRef, path: PathBuf) -> PoolResult<FRef>;
    async fn delete_from_disk(
        &self,
        target: WorkerId,
        dref: DRef,
        path: Option<PathBuf>,
    ) -> PoolResult<()>;
    async fn set_destroy_on_evict(&self, target: WorkerId, dref: DRef, flag: bool)
        -> PoolResult<()>;
    async fn delete(&self, target: WorkerId, dref: DRef) -> PoolResult<()>;
    async fn delete_file(&self, target: WorkerId, file: PathBuf) -> PoolResult<()>;
    async fn get_wrkrips(&self, target: WorkerId)
        -> PoolResult<HashMap<Ipv4Addr, Vec<WorkerId>>>;
    async fn external_ip(&self, target: WorkerId) -> PoolResult<Ipv4Addr>;
    async fn record_read(&self, target: WorkerId, file: PathBuf, dref: DRef) -> PoolResult<()>;
}
