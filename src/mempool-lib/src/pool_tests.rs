use crate::{
    DRef, DRefGuard, LoopbackNet, MemPool, MemPoolConfig, PeerEntry, PoolError, PoolRef,
    PutOptions, WorkerId,
};
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tempfile::TempDir;

struct Cluster {
    _temp: TempDir,
    net: Arc<LoopbackNet>,
    pools: Vec<Arc<MemPool>>,
}

impl Cluster {
    fn worker(&self, id: WorkerId) -> &Arc<MemPool> {
        &self.pools[(id - 1) as usize]
    }
}

fn peer_entries(addresses: &[&str]) -> Vec<PeerEntry> {
    addresses
        .iter()
        .enumerate()
        .map(|(i, address)| PeerEntry {
            worker_id: (i + 1) as WorkerId,
            address: address.to_string(),
        })
        .collect()
}

async fn make_cluster_with(
    addresses: &[&str],
    tweak: impl Fn(&mut MemPoolConfig),
) -> Cluster {
    let temp = tempfile::tempdir().unwrap();
    let net = LoopbackNet::new();
    let peers = peer_entries(addresses);
    let mut pools = Vec::new();
    for (i, address) in addresses.iter().enumerate() {
        let worker_id = (i + 1) as WorkerId;
        let mut config = MemPoolConfig::new(worker_id);
        config.address = address.to_string();
        config.peers = peers.clone();
        config.base_dir = Some(temp.path().join(format!("w{}", worker_id)));
        tweak(&mut config);
        let pool = MemPool::new(config, net.clone());
        net.register(&pool);
        pools.push(pool);
    }
    Cluster {
        _temp: temp,
        net,
        pools,
    }
}

async fn make_cluster(addresses: &[&str]) -> Cluster {
    make_cluster_with(addresses, |_| {}).await
}

fn payload(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

#[tokio::test]
async fn test_local_put_get() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    let guard = p1
        .put(Bytes::from_static(b"hello"), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(guard.get().await.unwrap(), Bytes::from_static(b"hello"));

    let d = guard.dref();
    assert_eq!(p1.local_holders(&d), 1);
    assert_eq!(p1.population(&d), 1);
}

#[tokio::test]
async fn test_cross_worker_fan_out_and_decay() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);
    let p3 = cluster.worker(3);

    let data = payload(64, 0x11);
    let guard = p1.put(data.clone(), PutOptions::default()).await.unwrap();
    let d = guard.dref();

    let g2 = p2.adopt(d);
    let g3 = p3.adopt(d);
    p2.flush_notices().await;
    p3.flush_notices().await;
    assert_eq!(p1.population(&d), 3);

    // Remote dereference goes through the owner.
    assert_eq!(g2.get().await.unwrap(), data);
    assert_eq!(g3.get().await.unwrap(), data);

    drop(g2);
    p2.flush_notices().await;
    assert_eq!(p1.population(&d), 2);

    drop(g3);
    p3.flush_notices().await;
    assert_eq!(p1.population(&d), 1);

    drop(guard);
    assert_eq!(p1.population(&d), 0);
    assert!(!p1.contains(d.id));
}

#[tokio::test]
async fn test_local_duplication_does_not_fan_out() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let guard = p1.put(payload(16, 0x22), PutOptions::default()).await.unwrap();
    let d = guard.dref();

    let g2 = p2.adopt(d);
    let copies: Vec<DRefGuard> = (0..100).map(|_| g2.clone()).collect();
    p2.flush_notices().await;

    // One hundred clones on worker 2 still count as a single population.
    assert_eq!(p2.local_holders(&d), 101);
    assert_eq!(p1.population(&d), 2);

    drop(copies);
    drop(g2);
    p2.flush_notices().await;
    assert_eq!(p1.population(&d), 1);
}

#[tokio::test]
async fn test_reacquire_after_full_drop_counts_again() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let guard = p1.put(payload(16, 0x33), PutOptions::default()).await.unwrap();
    let d = guard.dref();

    let g2 = p2.adopt(d);
    p2.flush_notices().await;
    assert_eq!(p1.population(&d), 2);

    drop(g2);
    p2.flush_notices().await;
    assert_eq!(p1.population(&d), 1);

    let g2 = p2.adopt(d);
    p2.flush_notices().await;
    assert_eq!(p1.population(&d), 2);
    drop(g2);
}

#[tokio::test]
async fn test_adopt_from_wire_bytes() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let data = payload(32, 0x44);
    let guard = p1.put(data.clone(), PutOptions::default()).await.unwrap();

    // The wire carries a plain value; the receiving side re-registers it.
    let encoded = serde_json::to_vec(&guard.dref()).unwrap();
    let decoded: DRef = serde_json::from_slice(&encoded).unwrap();
    let g2 = p2.adopt(decoded);
    p2.flush_notices().await;

    assert_eq!(p1.population(&guard.dref()), 2);
    assert_eq!(g2.get().await.unwrap(), data);
}

#[tokio::test]
async fn test_remote_put_forwards_to_owner() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let data = payload(48, 0x55);
    let opts = PutOptions {
        owner: Some(1),
        ..Default::default()
    };
    let guard = p2.put(data.clone(), opts).await.unwrap();
    assert_eq!(guard.owner(), 1);
    p2.flush_notices().await;

    assert!(p1.contains(guard.id()));
    assert_eq!(p1.population(&guard.dref()), 1);
    assert_eq!(guard.get().await.unwrap(), data);

    let d = guard.dref();
    drop(guard);
    p2.flush_notices().await;
    assert!(!p1.contains(d.id));
}

#[tokio::test]
async fn test_missing_ref_reads_the_same_local_and_remote() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let bogus = DRef {
        owner: 1,
        id: 9999,
        size: 0,
    };
    assert!(p1.get_dref(&bogus).await.unwrap_err().is_missing_ref());
    assert!(p2.get_dref(&bogus).await.unwrap_err().is_missing_ref());
}

#[tokio::test]
async fn test_unreachable_owner_is_a_transport_error() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    let stranger = DRef {
        owner: 42,
        id: 1,
        size: 0,
    };
    let err = p1.get_dref(&stranger).await.unwrap_err();
    assert!(matches!(err, PoolError::Transport(_)));
}

#[tokio::test]
async fn test_spill_round_trip() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    let data = payload(10 * 1024 * 1024, 0xA5);
    let guard = p1.put(data.clone(), PutOptions::default()).await.unwrap();
    let d = guard.dref();

    let fref = p1.move_to_disk(&d, None, false).await.unwrap();
    assert_eq!(fref.file, p1.default_path(&d));
    assert_eq!(fref.size, data.len() as u64);

    let state = p1.query_ref_state(d.id).unwrap();
    assert!(state.data.is_none());
    assert_eq!(state.file.as_deref(), Some(fref.file.as_path()));

    // Dereference restores lazily and transparently.
    assert_eq!(p1.get_dref(&d).await.unwrap(), data);
    assert!(p1.query_ref_state(d.id).unwrap().is_resident());
}

#[tokio::test]
async fn test_move_to_disk_twice_does_not_rewrite() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    let guard = p1.put(payload(128, 0x66), PutOptions::default()).await.unwrap();
    let d = guard.dref();
    let first = p1.move_to_disk(&d, None, true).await.unwrap();
    let mtime = std::fs::metadata(&first.file).unwrap().modified().unwrap();

    let second = p1.move_to_disk(&d, None, true).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        std::fs::metadata(&second.file).unwrap().modified().unwrap(),
        mtime
    );
}

#[tokio::test]
async fn test_remote_get_of_spilled_value_comes_back_as_file() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let data = payload(4096, 0x77);
    let guard = p1.put(data.clone(), PutOptions::default()).await.unwrap();
    let d = guard.dref();
    p1.move_to_disk(&d, None, false).await.unwrap();

    // The owner stays spilled; worker 2 pulls the bytes through the file.
    let g2 = p2.adopt(d);
    assert_eq!(g2.get().await.unwrap(), data);
    assert!(p1.query_ref_state(d.id).unwrap().data.is_none());
}

#[tokio::test]
async fn test_fref_locality_and_cache() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let data = payload(2048, 0x88);
    let guard = p1.put(data.clone(), PutOptions::default()).await.unwrap();
    let fref = p1.move_to_disk(&guard.dref(), None, false).await.unwrap();
    assert_eq!(fref.host, Ipv4Addr::new(10, 0, 0, 1));

    // First fetch routes the file read to a worker on the file's host.
    assert_eq!(p2.get_fref(&fref).await.unwrap(), data);

    // Second fetch hits file_to_dref; no peer traffic at all.
    cluster.net.unregister(1);
    assert_eq!(p2.get_fref(&fref).await.unwrap(), data);
}

#[tokio::test]
async fn test_loopback_reconciliation() {
    let temp = tempfile::tempdir().unwrap();
    let net = LoopbackNet::new();
    let master_ip = Ipv4Addr::new(10, 0, 0, 5);
    let peers = vec![
        PeerEntry {
            worker_id: 1,
            address: "10.0.0.5".to_string(),
        },
        PeerEntry {
            worker_id: 2,
            address: "127.0.0.1".to_string(),
        },
        PeerEntry {
            worker_id: 3,
            address: "127.0.0.1".to_string(),
        },
    ];
    let mut pools = Vec::new();
    for worker_id in 1..=3 {
        let mut config = MemPoolConfig::new(worker_id);
        config.peers = peers.clone();
        config.base_dir = Some(temp.path().join(format!("w{}", worker_id)));
        if worker_id == 1 {
            config.address = "10.0.0.5".to_string();
        } else {
            config.address = "127.0.0.1".to_string();
            config.external_ip = Some(master_ip);
        }
        let pool = MemPool::new(config, net.clone());
        net.register(&pool);
        pools.push(pool);
    }

    let workers = pools[1].workers_at(master_ip).await.unwrap();
    assert_eq!(workers, vec![1, 2, 3]);
    assert!(pools[1]
        .workers_at(Ipv4Addr::LOCALHOST)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_save_to_disk_leaves_state_alone() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    let data = payload(256, 0x99);
    let guard = p1.put(data.clone(), PutOptions::default()).await.unwrap();
    let d = guard.dref();

    let target = cluster._temp.path().join("export.bin");
    let fref = p1.save_to_disk(&d, target.clone()).await.unwrap();
    assert_eq!(fref.file, target);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);

    let state = p1.query_ref_state(d.id).unwrap();
    assert!(state.file.is_none());
    assert!(state.is_resident());
}

#[tokio::test]
async fn test_copy_then_delete_from_disk() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    let guard = p1.put(payload(64, 0xAA), PutOptions::default()).await.unwrap();
    let d = guard.dref();

    let target = cluster._temp.path().join("copy.bin");
    let fref = p1.copy_to_disk(&d, target.clone()).await.unwrap();
    let state = p1.query_ref_state(d.id).unwrap();
    assert!(state.is_resident());
    assert_eq!(state.file.as_deref(), Some(target.as_path()));

    p1.delete_from_disk(&d, None).await.unwrap();
    assert!(!target.exists());
    assert!(p1.query_ref_state(d.id).unwrap().file.is_none());
    // Idempotent on re-delete.
    p1.delete_from_disk(&d, Some(fref.file)).await.unwrap();
}

#[tokio::test]
async fn test_destroy_removes_own_spill_file_only() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    // A spilled payload dies with its ref.
    let guard = p1.put(payload(64, 0xBB), PutOptions::default()).await.unwrap();
    let spill_file = p1.move_to_disk(&guard.dref(), None, true).await.unwrap().file;
    drop(guard);
    p1.flush_notices().await;
    assert!(!spill_file.exists());

    // A payload loaded from a user file leaves the file behind.
    let user_file = cluster._temp.path().join("input.bin");
    tokio::fs::write(&user_file, b"user data").await.unwrap();
    let opts = PutOptions {
        file: Some(user_file.clone()),
        ..Default::default()
    };
    let guard = p1
        .put(Bytes::from_static(b"user data"), opts)
        .await
        .unwrap();
    drop(guard);
    p1.flush_notices().await;
    assert!(user_file.exists());
}

#[tokio::test]
async fn test_delete_dref_is_forceful_and_idempotent() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let guard = p1.put(payload(64, 0xCC), PutOptions::default()).await.unwrap();
    let d = guard.dref();
    let g2 = p2.adopt(d);
    p2.flush_notices().await;
    assert_eq!(p1.population(&d), 2);

    // Forwarded delete destroys despite two live holders.
    p2.delete(&PoolRef::Obj(d)).await.unwrap();
    assert!(!p1.contains(d.id));
    assert_eq!(p1.population(&d), 0);
    p2.delete(&PoolRef::Obj(d)).await.unwrap();

    // Outstanding guards drop without tripping the protocol.
    drop(g2);
    drop(guard);
    p2.flush_notices().await;
    p1.flush_notices().await;
}

#[tokio::test]
async fn test_delete_fref_removes_file_and_cache_entry() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    let guard = p1.put(payload(64, 0xDD), PutOptions::default()).await.unwrap();
    let target = cluster._temp.path().join("save.bin");
    let fref = p1.save_to_disk(&guard.dref(), target.clone()).await.unwrap();

    p1.delete(&PoolRef::File(fref.clone())).await.unwrap();
    assert!(!target.exists());
    p1.delete(&PoolRef::File(fref)).await.unwrap();
}

#[tokio::test]
async fn test_destroy_on_evict_under_memory_cap() {
    let cluster = make_cluster_with(&["10.0.0.1"], |config| {
        config.max_memsize = Some(100);
    })
    .await;
    let p1 = cluster.worker(1);

    let opts = PutOptions {
        destroy_on_evict: true,
        ..Default::default()
    };
    let victim = p1.put(payload(60, 0x01), opts).await.unwrap();
    let keeper = p1.put(payload(60, 0x02), PutOptions::default()).await.unwrap();

    assert!(!p1.contains(victim.id()));
    assert!(p1.contains(keeper.id()));
    assert!(p1.mem_used() <= 100);
    drop(victim);
}

#[tokio::test]
async fn test_spill_to_disk_under_memory_cap() {
    let cluster = make_cluster_with(&["10.0.0.1"], |config| {
        config.max_memsize = Some(100);
        config.spill_to_disk = true;
    })
    .await;
    let p1 = cluster.worker(1);

    let first = p1.put(payload(60, 0x03), PutOptions::default()).await.unwrap();
    let second = p1.put(payload(60, 0x04), PutOptions::default()).await.unwrap();

    // The older payload went to disk instead of being destroyed.
    let state = p1.query_ref_state(first.id()).unwrap();
    assert!(state.data.is_none());
    assert!(state.file.is_some());
    assert!(p1.query_ref_state(second.id()).unwrap().is_resident());

    // Getting it back restores the bytes and pressures the other one out.
    assert_eq!(first.get().await.unwrap(), payload(60, 0x03));
    assert!(p1.query_ref_state(first.id()).unwrap().is_resident());
    assert!(p1.query_ref_state(second.id()).unwrap().data.is_none());
}

#[tokio::test]
async fn test_who_has_read_records_on_coordinator() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let data = payload(512, 0xEE);
    let guard = p1.put(data.clone(), PutOptions::default()).await.unwrap();
    let fref = p1.move_to_disk(&guard.dref(), None, false).await.unwrap();

    p2.get_fref(&fref).await.unwrap();
    p2.flush_notices().await;

    let readers = p1.who_has_read(&fref.file);
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0].owner, 2);
}

#[tokio::test]
async fn test_set_destroy_on_evict_forwards_to_owner() {
    let cluster = make_cluster(&["10.0.0.1", "10.0.0.2"]).await;
    let p1 = cluster.worker(1);
    let p2 = cluster.worker(2);

    let guard = p1.put(payload(64, 0xFF), PutOptions::default()).await.unwrap();
    let d = guard.dref();
    assert!(!p1.query_ref_state(d.id).unwrap().destroy_on_evict);

    p2.set_destroy_on_evict(&d, true).await.unwrap();
    assert!(p1.query_ref_state(d.id).unwrap().destroy_on_evict);
}

#[tokio::test]
async fn test_cleanup_purges_worker() {
    let cluster = make_cluster(&["10.0.0.1"]).await;
    let p1 = cluster.worker(1);

    let guard = p1.put(payload(64, 0x10), PutOptions::default()).await.unwrap();
    let spilled = p1.put(payload(64, 0x20), PutOptions::default()).await.unwrap();
    p1.move_to_disk(&spilled.dref(), None, false).await.unwrap();
    assert!(p1.session_dir().exists());

    p1.cleanup().await.unwrap();
    assert!(!p1.contains(guard.id()));
    assert!(!p1.contains(spilled.id()));
    assert!(!p1.session_dir().exists());
    assert!(guard.get().await.unwrap_err().is_missing_ref());

    drop(guard);
    drop(spilled);
}
