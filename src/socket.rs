use std::fs;
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use error::{Error, Result};

/// Well-known path the collector listens on for agent handshakes.
pub const CONTROL_PATH: &'static str = "/tmp/agent-control.sock";

/// Filesystem contract with the collector for the per-CPU sample streams.
pub fn cpu_socket_path(cpu: usize, label: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/agent-{}-{}.sock", cpu, label))
}

/// One accepted collector connection per CPU plus the control stream. After
/// startup the fabric is write-only: samples go out on their CPU's stream,
/// thread exits and the shutdown marker on CPU 0 and the control stream.
///
/// A CPU stream that fails a send is dropped and sampling output for that CPU
/// becomes lossy; the agent itself keeps running.
pub struct SocketFabric {
    streams: Vec<Option<UnixStream>>,
    control: UnixStream,
    paths: Vec<PathBuf>,
}

impl SocketFabric {
    /// Bind one server socket per CPU, handshake on the collector's control
    /// socket, then wait until the collector has connected to every per-CPU
    /// socket. Counters must not be armed before this returns. On any error
    /// every socket file created so far is removed again.
    pub fn connect(cores: usize, label: &str, command: &str) -> Result<Self> {
        Self::with_control_path(cores, label, command, CONTROL_PATH)
    }

    pub fn with_control_path(
        cores: usize,
        label: &str,
        command: &str,
        control_path: &str,
    ) -> Result<Self> {
        let mut paths = Vec::with_capacity(cores);
        for cpu in 0..cores {
            paths.push(cpu_socket_path(cpu, label));
        }

        let fabric = Self::bind_and_accept(&paths, command, label, control_path);
        if fabric.is_err() {
            for path in &paths {
                let _ = fs::remove_file(path);
            }
        }
        fabric
    }

    fn bind_and_accept(
        paths: &[PathBuf],
        command: &str,
        label: &str,
        control_path: &str,
    ) -> Result<Self> {
        let mut servers = Vec::with_capacity(paths.len());

        for path in paths {
            // a dead agent may have left its socket file behind
            let _ = fs::remove_file(path);

            let server = UnixListener::bind(path).map_err(|inner| Error::Socket {
                path: path.display().to_string(),
                inner,
            })?;
            servers.push(server);
        }

        let mut control =
            UnixStream::connect(control_path).map_err(|inner| Error::Handshake { inner })?;
        control
            .write_all(format!("{}\n", label).as_bytes())
            .and_then(|()| control.write_all(format!("{}\n", command).as_bytes()))
            .map_err(|inner| Error::Handshake { inner })?;

        // order-insensitive on the collector side, but all of them must be
        // connected before any counter fires
        let mut streams = Vec::with_capacity(servers.len());
        for (cpu, server) in servers.iter().enumerate() {
            let (stream, _) = server.accept().map_err(|inner| Error::Socket {
                path: paths[cpu].display().to_string(),
                inner,
            })?;
            info!("collector connected for cpu {}", cpu);
            streams.push(Some(stream));
        }

        Ok(SocketFabric {
            streams,
            control,
            paths: paths.to_vec(),
        })
    }

    /// Best-effort send of one frame on `cpu`'s stream.
    pub fn send(&mut self, cpu: usize, frame: &[u8]) {
        let healthy = match self.streams.get_mut(cpu) {
            Some(&mut Some(ref mut stream)) => stream.write_all(frame).is_ok(),
            _ => return,
        };

        if !healthy {
            warn!("send failed on the cpu {} socket, its samples are lost from here on", cpu);
            self.streams[cpu] = None;
        }
    }

    /// Thread-exit records always travel on the CPU-0 stream.
    pub fn send_exit(&mut self, frame: &[u8]) {
        self.send(0, frame)
    }

    /// Tell the collector we're done. Socket files are removed on drop.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.control.write_all(b"END\n") {
            warn!("could not send the termination marker: {}", e);
        }
    }
}

impl Drop for SocketFabric {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::thread;

    use super::*;

    /// A stand-in collector: accepts the handshake, connects to each per-CPU
    /// socket, and hands back everything it read.
    fn fake_collector(
        cores: usize,
        label: String,
        control_path: String,
    ) -> thread::JoinHandle<(Vec<String>, Vec<u8>)> {
        let control = UnixListener::bind(&control_path).unwrap();

        thread::spawn(move || {
            let (stream, _) = control.accept().unwrap();
            let mut lines = BufReader::new(stream);

            let mut greeting = Vec::new();
            for _ in 0..2 {
                let mut line = String::new();
                lines.read_line(&mut line).unwrap();
                greeting.push(line.trim_right().to_string());
            }

            let mut cpu_streams: Vec<UnixStream> = (0..cores)
                .map(|cpu| UnixStream::connect(cpu_socket_path(cpu, &label)).unwrap())
                .collect();

            let mut sampled = Vec::new();
            cpu_streams[0].read_to_end(&mut sampled).unwrap();

            let mut end = String::new();
            lines.read_line(&mut end).unwrap();
            greeting.push(end.trim_right().to_string());

            (greeting, sampled)
        })
    }

    #[test]
    fn handshake_send_and_shutdown() {
        let unique = format!("fabric-test-{}", ::std::process::id());
        let control_path = format!("/tmp/agent-test-control-{}.sock", ::std::process::id());
        let _ = fs::remove_file(&control_path);

        let collector = fake_collector(2, unique.clone(), control_path.clone());

        {
            let mut fabric =
                SocketFabric::with_control_path(2, &unique, "some-target", &control_path).unwrap();

            fabric.send(0, b"\x00\x00\x00\x01x");
            fabric.shutdown();
        } // dropped: streams close, socket files unlinked

        let (greeting, sampled) = collector.join().unwrap();
        assert_eq!(
            greeting,
            vec![unique.clone(), "some-target".to_string(), "END".to_string()]
        );
        assert_eq!(sampled, b"\x00\x00\x00\x01x");

        for cpu in 0..2 {
            assert!(!cpu_socket_path(cpu, &unique).exists());
        }

        let _ = fs::remove_file(&control_path);
    }
}
