//! The socket client against an in-process daemon.

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::thread;

use zygisk_loader::daemon::{Daemon, DaemonClient};
use zygisk_protocol::{send_fd, DaemonSocketAction, MountNamespace, ProcessFlags, StreamExt};

/// Serve `connections` requests, then stop.
fn serve(connections: usize) -> (tempfile::TempDir, PathBuf, thread::JoinHandle<Vec<DaemonSocketAction>>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cp64.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let handle = thread::spawn(move || {
        let mut seen = Vec::new();
        for stream in listener.incoming().take(connections) {
            let mut stream = stream.unwrap();
            let action = DaemonSocketAction::try_from(stream.read_u8().unwrap()).unwrap();
            seen.push(action);
            handle_request(action, &mut stream);
        }
        seen
    });
    (dir, path, handle)
}

fn handle_request(action: DaemonSocketAction, stream: &mut UnixStream) {
    match action {
        DaemonSocketAction::GetProcessFlags => {
            let uid = stream.read_u32().unwrap();
            let flags = if uid == 10123 { ProcessFlags::PROCESS_ON_DENYLIST } else { ProcessFlags::empty() };
            stream.write_u32(flags.bits()).unwrap();
        }
        DaemonSocketAction::UpdateMountNamespace => {
            match stream.read_u8().unwrap() {
                0 => {
                    stream.write_u32(812).unwrap();
                    stream.write_u32(14).unwrap();
                }
                _ => {
                    stream.write_u32(0).unwrap();
                    stream.write_u32(0).unwrap();
                }
            }
        }
        DaemonSocketAction::ReadModules => {
            let mut image = tempfile::tempfile().unwrap();
            image.write_all(b"\x7fELF").unwrap();
            stream.write_usize(1).unwrap();
            stream.write_string("example").unwrap();
            send_fd(stream, image.as_raw_fd()).unwrap();
        }
        DaemonSocketAction::RequestCompanionSocket => {
            let id = stream.read_usize().unwrap();
            stream.write_u8(u8::from(id == 0)).unwrap();
            if id == 0 {
                stream.write_all(b"hi").unwrap();
            }
        }
        DaemonSocketAction::CacheMountNamespace => {
            stream.read_u32().unwrap();
        }
        _ => {}
    }
}

#[test]
fn test_process_flags() {
    let (_dir, path, server) = serve(2);
    let client = DaemonClient::new(&path);

    assert_eq!(client.get_process_flags(10123).unwrap(), ProcessFlags::PROCESS_ON_DENYLIST);
    assert_eq!(client.get_process_flags(10124).unwrap(), ProcessFlags::empty());
    assert_eq!(server.join().unwrap(), [DaemonSocketAction::GetProcessFlags; 2]);
}

#[test]
fn test_namespace_path() {
    let (_dir, path, server) = serve(2);
    let client = DaemonClient::new(&path);

    assert_eq!(client.update_mount_namespace(MountNamespace::Clean).unwrap(), "/proc/812/fd/14");
    assert!(client.update_mount_namespace(MountNamespace::Root).is_err());
    server.join().unwrap();
}

#[test]
fn test_module_images_arrive_as_descriptors() {
    let (_dir, path, server) = serve(1);
    let client = DaemonClient::new(&path);

    let modules = client.read_modules().unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].name, "example");

    let mut file = std::fs::File::from(modules.into_iter().next().unwrap().fd);
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut magic = Vec::new();
    file.read_to_end(&mut magic).unwrap();
    assert_eq!(magic, b"\x7fELF");
    server.join().unwrap();
}

#[test]
fn test_companion_channel() {
    let (_dir, path, server) = serve(2);
    let client = DaemonClient::new(&path);

    let channel = client.connect_companion(0).unwrap();
    let mut channel = UnixStream::from(channel);
    let mut greeting = [0u8; 2];
    channel.read_exact(&mut greeting).unwrap();
    assert_eq!(&greeting, b"hi");

    assert!(client.connect_companion(3).is_err());
    server.join().unwrap();
}

#[test]
fn test_fire_and_forget_requests() {
    let (_dir, path, server) = serve(3);
    let client = DaemonClient::new(&path);

    client.ping().unwrap();
    client.system_server_started().unwrap();
    client.cache_mount_namespace(4242).unwrap();
    assert_eq!(
        server.join().unwrap(),
        [
            DaemonSocketAction::PingHeartbeat,
            DaemonSocketAction::SystemServerStarted,
            DaemonSocketAction::CacheMountNamespace,
        ]
    );
}

#[test]
fn test_unreachable_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let client = DaemonClient::new(dir.path().join("missing.sock"));
    assert!(client.ping().is_err());
    assert!(client.get_process_flags(0).is_err());
}
