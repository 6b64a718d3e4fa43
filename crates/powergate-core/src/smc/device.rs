//! Controller transport over a character device node.
//!
//! Each method call is one framed exchange on the device:
//!
//! ```text
//! request:  [selector u32][len u32][input bytes]
//! reply:    [kern_return i32][len u32][output bytes]
//! ```
//!
//! All integers are host byte order, matching the parameter structure.
//! An I/O error part-way through an exchange leaves the framing out of sync,
//! so the transport refuses every later call until the device is reopened.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::{IO_RETURN_ERROR, KERN_SUCCESS, SmcService, SmcTransport};

/// Largest reply body accepted from the device.
const MAX_REPLY_LEN: usize = 4096;

/// Resolves the controller by opening a device node.
#[derive(Debug, Clone)]
pub struct DeviceService {
    path: PathBuf,
}

impl DeviceService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SmcService for DeviceService {
    fn connect(&self) -> Option<Box<dyn SmcTransport>> {
        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => {
                debug!(path = %self.path.display(), "opened controller device");
                Some(Box::new(DeviceTransport::new(file)))
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "controller device unavailable");
                None
            }
        }
    }
}

/// Framed transport over any blocking byte stream.
pub struct DeviceTransport<S = File> {
    stream: Mutex<Framed<S>>,
}

struct Framed<S> {
    stream: S,
    poisoned: bool,
}

impl<S> DeviceTransport<S>
where
    S: Read + Write + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: Mutex::new(Framed {
                stream,
                poisoned: false,
            }),
        }
    }

    /// Whether an earlier I/O error has desynchronised the stream.
    pub fn is_poisoned(&self) -> bool {
        self.stream.lock().map_or(true, |framed| framed.poisoned)
    }

    fn exchange(stream: &mut S, selector: u32, input: &[u8]) -> std::io::Result<(i32, Vec<u8>)> {
        let mut frame = Vec::with_capacity(8 + input.len());
        frame.extend_from_slice(&selector.to_ne_bytes());
        frame.extend_from_slice(&(input.len() as u32).to_ne_bytes());
        frame.extend_from_slice(input);
        stream.write_all(&frame)?;
        stream.flush()?;

        let mut header = [0u8; 8];
        stream.read_exact(&mut header)?;
        let kern_return = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_REPLY_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("reply of {len} bytes exceeds limit"),
            ));
        }

        let mut output = vec![0u8; len];
        stream.read_exact(&mut output)?;
        Ok((kern_return, output))
    }
}

impl<S> SmcTransport for DeviceTransport<S>
where
    S: Read + Write + Send,
{
    fn call_method(&self, selector: u32, input: &[u8]) -> Result<Vec<u8>, i32> {
        let mut framed = self.stream.lock().map_err(|_| IO_RETURN_ERROR)?;
        if framed.poisoned {
            debug!(selector, "controller device stream is out of sync");
            return Err(IO_RETURN_ERROR);
        }
        match Self::exchange(&mut framed.stream, selector, input) {
            Ok((KERN_SUCCESS, output)) => Ok(output),
            Ok((kern_return, _)) => Err(kern_return),
            Err(e) => {
                warn!(selector, error = %e, "controller device exchange failed, closing stream");
                framed.poisoned = true;
                Err(IO_RETURN_ERROR)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;
    use crate::smc::{FourCc, ParamStruct, SmcClient, param, selector};

    /// Serve `count` framed calls on `peer`, echoing each request back with
    /// the payload's first byte incremented.
    fn serve(mut peer: UnixStream, count: usize, kern_return: i32) -> thread::JoinHandle<Vec<u32>> {
        thread::spawn(move || {
            let mut selectors = Vec::new();
            for _ in 0..count {
                let mut header = [0u8; 8];
                if peer.read_exact(&mut header).is_err() {
                    break;
                }
                let sel = u32::from_ne_bytes(header[..4].try_into().unwrap());
                let len = u32::from_ne_bytes(header[4..].try_into().unwrap()) as usize;
                let mut input = vec![0u8; len];
                peer.read_exact(&mut input).unwrap();
                selectors.push(sel);

                let output = if sel == selector::HANDLE_EVENT {
                    let mut reply = ParamStruct::decode(&input).unwrap();
                    reply.payload[0] = reply.payload[0].wrapping_add(1);
                    reply.encode().to_vec()
                } else {
                    Vec::new()
                };
                peer.write_all(&kern_return.to_ne_bytes()).unwrap();
                peer.write_all(&(output.len() as u32).to_ne_bytes()).unwrap();
                peer.write_all(&output).unwrap();
            }
            selectors
        })
    }

    struct Paired(Mutex<Option<UnixStream>>);

    impl SmcService for Paired {
        fn connect(&self) -> Option<Box<dyn SmcTransport>> {
            self.0
                .lock()
                .unwrap()
                .take()
                .map(|s| Box::new(DeviceTransport::new(s)) as Box<dyn SmcTransport>)
        }
    }

    #[test]
    fn test_framed_exchange_through_client() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = serve(theirs, 3, KERN_SUCCESS);

        let mut client = SmcClient::new();
        assert!(client.open(&Paired(Mutex::new(Some(ours)))));
        assert_eq!(client.read_u8(FourCc::new(*b"CH0B")), Ok(1));
        client.close();

        assert_eq!(
            server.join().unwrap(),
            vec![
                selector::USER_CLIENT_OPEN,
                selector::HANDLE_EVENT,
                selector::USER_CLIENT_CLOSE
            ]
        );
    }

    #[test]
    fn test_nonzero_kern_return_is_error() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = serve(theirs, 1, IO_RETURN_ERROR);

        let transport = DeviceTransport::new(ours);
        let input = ParamStruct::default().encode();
        assert_eq!(
            transport.call_method(selector::HANDLE_EVENT, &input),
            Err(IO_RETURN_ERROR)
        );
        server.join().unwrap();
    }

    #[test]
    fn test_closed_peer_is_io_error() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);

        let transport = DeviceTransport::new(ours);
        assert_eq!(
            transport.call_method(selector::HANDLE_EVENT, &[0u8; param::PARAM_STRUCT_SIZE]),
            Err(IO_RETURN_ERROR)
        );
    }

    /// Accepts every write and replays a fixed reply script.
    struct Scripted {
        replies: std::io::Cursor<Vec<u8>>,
        writes: usize,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.replies.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes += 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_truncated_reply_poisons_transport() {
        let mut replies = Vec::new();
        replies.extend_from_slice(&KERN_SUCCESS.to_ne_bytes());
        replies.extend_from_slice(&(param::PARAM_STRUCT_SIZE as u32).to_ne_bytes());
        replies.extend_from_slice(&[0u8; 10]);
        let transport = DeviceTransport::new(Scripted {
            replies: std::io::Cursor::new(replies),
            writes: 0,
        });
        let input = ParamStruct::default().encode();

        assert_eq!(
            transport.call_method(selector::HANDLE_EVENT, &input),
            Err(IO_RETURN_ERROR)
        );
        assert!(transport.is_poisoned());
        let writes = transport.stream.lock().unwrap().stream.writes;

        assert_eq!(
            transport.call_method(selector::HANDLE_EVENT, &input),
            Err(IO_RETURN_ERROR)
        );
        assert_eq!(transport.stream.lock().unwrap().stream.writes, writes);
    }

    #[test]
    fn test_kern_error_does_not_poison() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = serve(theirs, 2, IO_RETURN_ERROR);

        let transport = DeviceTransport::new(ours);
        let input = ParamStruct::default().encode();
        for _ in 0..2 {
            assert_eq!(
                transport.call_method(selector::HANDLE_EVENT, &input),
                Err(IO_RETURN_ERROR)
            );
        }
        assert!(!transport.is_poisoned());
        assert_eq!(server.join().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_device_node() {
        let service = DeviceService::new("/nonexistent/powergate-smc");
        assert!(service.connect().is_none());
    }
}
