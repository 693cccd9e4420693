// Concurrency tests: module threads and client connections writing matrices
// at the same time. Every writer stores a matrix whose 16 elements are equal,
// so any reader observing two different elements saw a torn write.
//
// A second client builds objects in its own scene throughout, and both
// scenes are checked afterwards.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use vrms::client::Client;
use vrms::modules::{Module, ModuleContext, ModuleHost};
use vrms::protocol::{ElementType, Matrix, MatrixKind, RenderEntry, Reply, UpdateMode};
use vrms::runtime::{Runtime, SharedRuntime};
use vrms::server::{Server, ServerConfig};

const WRITES: usize = 2_000;
const BUILD_ROUNDS: usize = 50;

fn uniform(v: f32) -> Matrix {
    [v; 16]
}

fn assert_untorn(m: &Matrix) {
    assert!(m.iter().all(|x| *x == m[0]), "torn matrix: {m:?}");
}

fn ok(reply: Reply) -> u32 {
    reply.into_result().unwrap().get()
}

/// Repeatedly creates float data, geometry over it, and a one-entry render
/// set in its own scene. Returns the still-open client and its scene.
fn build_scene(path: &std::path::Path) -> (Client, u32) {
    let mut client = Client::connect(path).unwrap();
    let scene = ok(client.create_scene("bystander").unwrap());
    let file = tempfile::tempfile().unwrap();
    file.set_len(4096).unwrap();
    let memory = ok(client.create_memory(scene, &file, 4096).unwrap());

    for round in 0..BUILD_ROUNDS {
        let offset = (round as u64 % 16) * 64;
        let data: Vec<u32> = (0..3)
            .map(|_| {
                ok(client.create_data_object(scene, memory, offset, 64, ElementType::F32).unwrap())
            })
            .collect();
        let geometry = ok(client.create_geometry_object(scene, data[0], data[1], data[2]).unwrap());
        let entries = vec![RenderEntry { matrix: data[0], texture: 0, geometry }];
        assert_eq!(ok(client.set_render_buffer(scene, entries).unwrap()), scene);
    }
    (client, scene)
}

/// Writes uniform global matrices as fast as it can.
struct Hammer {
    kind: MatrixKind,
    written: Arc<AtomicUsize>,
}

impl Module for Hammer {
    fn name(&self) -> &str {
        "hammer"
    }

    fn run(self: Box<Self>, ctx: ModuleContext) {
        let mut n = 0u32;
        while !ctx.is_stopped() {
            n = n.wrapping_add(1);
            ctx.update_system_matrix_module(self.kind, UpdateMode::Set, uniform(n as f32));
            self.written.fetch_add(1, Ordering::Relaxed);
            thread::yield_now();
        }
    }
}

#[test]
fn test_module_writes_are_never_torn() {
    let runtime: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());
    let mut host = ModuleHost::new(Arc::clone(&runtime));
    let written = Arc::new(AtomicUsize::new(0));
    for kind in [MatrixKind::Head, MatrixKind::Body] {
        host.spawn(Box::new(Hammer { kind, written: Arc::clone(&written) })).unwrap();
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                for _ in 0..WRITES {
                    assert_untorn(&runtime.system_matrix(None, MatrixKind::Head));
                    assert_untorn(&runtime.system_matrix(None, MatrixKind::Body));
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }

    host.shutdown();
    assert!(written.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_client_and_module_updates_interleave_safely() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("vrms.sock");
    let runtime: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());

    let (tx, rx) = mpsc::channel();
    let config = ServerConfig { socket_path: path.clone(), idle_timeout: None };
    let server_runtime = Arc::clone(&runtime);
    let server_thread = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let server = Server::bind(&config, server_runtime).unwrap();
            tx.send(server.shutdown_token()).unwrap();
            server.run().await.unwrap();
        });
    });
    let token = rx.recv().unwrap();

    let mut host = ModuleHost::new(Arc::clone(&runtime));
    let written = Arc::new(AtomicUsize::new(0));
    host.spawn(Box::new(Hammer { kind: MatrixKind::Body, written: Arc::clone(&written) }))
        .unwrap();

    let mut client = Client::connect(&path).unwrap();
    let scene = ok(client.create_scene("contended").unwrap());

    let builder = {
        let path = path.clone();
        thread::spawn(move || build_scene(&path))
    };

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let runtime = Arc::clone(&runtime);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                assert_untorn(&runtime.system_matrix(Some(scene), MatrixKind::Body));
                assert_untorn(&runtime.system_matrix(None, MatrixKind::Body));
            }
        })
    };

    let started = Instant::now();
    for i in 0..200 {
        let reply = client
            .update_system_matrix(scene, MatrixKind::Body, UpdateMode::Set, uniform(-(i as f32)))
            .unwrap();
        assert_eq!(reply.into_result().unwrap().get(), scene);
    }
    assert!(started.elapsed() < Duration::from_secs(30));

    let (bystander, other) = builder.join().unwrap();
    done.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    // The scene slot holds the client's last write, untouched by the module.
    assert_eq!(runtime.system_matrix(Some(scene), MatrixKind::Body), uniform(-199.0));

    // Neither scene picked up the other's state.
    let contended = runtime.scene_summary(scene).unwrap();
    assert_eq!(contended.name, "contended");
    assert!(contended.objects.is_empty());
    assert_eq!(contended.render_entries, 0);

    let built = runtime.scene_summary(other).unwrap();
    assert_eq!(built.name, "bystander");
    assert_eq!(built.objects.get("memory"), Some(&1));
    assert_eq!(built.objects.get("data object"), Some(&(3 * BUILD_ROUNDS)));
    assert_eq!(built.objects.get("geometry"), Some(&BUILD_ROUNDS));
    assert_eq!(built.mapped_bytes, 4096);
    assert_eq!(built.render_entries, 1);

    host.shutdown();
    drop(bystander);
    drop(client);
    token.cancel();
    server_thread.join().unwrap();
    assert!(runtime.scene_ids().is_empty());
}
