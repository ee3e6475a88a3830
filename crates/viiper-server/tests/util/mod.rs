#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use viiper_server::{Server, ServerConfig};
use viiper_usbip_protocol as proto;
use viiper_usbip_protocol::{CmdSubmit, RetSubmit, RetUnlink};

/// Ephemeral-port config for tests.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        usbip_listen_addr: "127.0.0.1:0".parse().unwrap(),
        control_listen_addr: "127.0.0.1:0".parse().unwrap(),
        // Tests create devices well before feeders attach; keep reaping out
        // of the way unless a test opts in.
        device_handler_connect_timeout: Duration::from_secs(60),
        bus_cleanup_timeout: Duration::from_secs(60),
        ..ServerConfig::default()
    }
}

pub async fn start(config: ServerConfig) -> Server {
    Server::start(config).await.expect("start server")
}

/// One-shot control request: connect, send `<request>\x00`, read to EOF.
pub async fn control_raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect control");
    stream.write_all(request).await.expect("send request");
    stream.write_all(&[0]).await.expect("send terminator");
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("read response");
    response
}

/// One-shot request returning the parsed JSON line.
pub async fn control_json(addr: SocketAddr, request: &str) -> serde_json::Value {
    let response = control_raw(addr, request.as_bytes()).await;
    let line = response
        .strip_suffix(b"\n")
        .unwrap_or_else(|| panic!("response not newline-terminated: {response:?}"));
    serde_json::from_slice(line)
        .unwrap_or_else(|e| panic!("bad json {e}: {:?}", String::from_utf8_lossy(line)))
}

/// Open a feeder stream; the connection stays in binary mode on success.
pub async fn open_stream(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect control");
    stream.write_all(path.as_bytes()).await.expect("send path");
    stream.write_all(&[0]).await.expect("send terminator");
    stream
}

/// Minimal USB/IP client used by the wire-level scenarios.
pub struct UsbipClient {
    stream: TcpStream,
    next_seqnum: u32,
}

/// Fields the tests assert on out of a devlist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevlistEntry {
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub interfaces: Vec<(u8, u8, u8)>,
}

impl UsbipClient {
    pub async fn connect(addr: SocketAddr) -> UsbipClient {
        let stream = TcpStream::connect(addr).await.expect("connect usbip");
        stream.set_nodelay(true).expect("nodelay");
        UsbipClient {
            stream,
            next_seqnum: 1,
        }
    }

    pub async fn devlist(addr: SocketAddr) -> Vec<DevlistEntry> {
        let mut client = UsbipClient::connect(addr).await;
        client
            .stream
            .write_all(&proto::encode_devlist_request())
            .await
            .expect("send devlist");

        let mut header = [0u8; proto::OP_HEADER_LEN];
        client.stream.read_exact(&mut header).await.expect("reply header");
        let header = proto::decode_op_header(&header).expect("decode header");
        assert_eq!(header.command, proto::OP_REP_DEVLIST);
        assert_eq!(header.status, proto::ST_OK);

        let mut count = [0u8; 4];
        client.stream.read_exact(&mut count).await.expect("device count");
        let count = u32::from_be_bytes(count);

        let mut entries = Vec::new();
        for _ in 0..count {
            let mut block = [0u8; proto::EXPORTED_DEVICE_LEN];
            client.stream.read_exact(&mut block).await.expect("device block");
            let n_interfaces = block[311] as usize;
            let mut interfaces = Vec::new();
            for _ in 0..n_interfaces {
                let mut triple = [0u8; 4];
                client.stream.read_exact(&mut triple).await.expect("triple");
                interfaces.push((triple[0], triple[1], triple[2]));
            }
            entries.push(parse_block(&block, interfaces));
        }
        entries
    }

    /// Returns the reply status and, on success, the parsed device block.
    pub async fn import(&mut self, busid: &str) -> (u32, Option<DevlistEntry>) {
        self.stream
            .write_all(&proto::encode_import_request(busid).expect("encode import"))
            .await
            .expect("send import");

        let mut header = [0u8; proto::OP_HEADER_LEN];
        self.stream.read_exact(&mut header).await.expect("reply header");
        let header = proto::decode_op_header(&header).expect("decode header");
        assert_eq!(header.command, proto::OP_REP_IMPORT);
        if header.status != proto::ST_OK {
            return (header.status, None);
        }
        let mut block = [0u8; proto::EXPORTED_DEVICE_LEN];
        self.stream.read_exact(&mut block).await.expect("device block");
        (header.status, Some(parse_block(&block, Vec::new())))
    }

    /// Submit a URB and bump the sequence number.
    pub async fn submit(
        &mut self,
        ep: u32,
        direction: u32,
        transfer_buffer_length: u32,
        setup: [u8; 8],
        payload: &[u8],
    ) -> u32 {
        let seqnum = self.next_seqnum;
        self.next_seqnum += 1;
        let cmd = CmdSubmit {
            seqnum,
            devid: 0x0001_0001,
            direction,
            ep,
            transfer_flags: 0,
            transfer_buffer_length,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup,
        };
        self.stream
            .write_all(&proto::encode_cmd_submit(&cmd))
            .await
            .expect("send submit");
        if direction == proto::DIR_OUT && !payload.is_empty() {
            self.stream.write_all(payload).await.expect("send payload");
        }
        seqnum
    }

    pub async fn unlink(&mut self, target_seqnum: u32) -> RetUnlink {
        let seqnum = self.next_seqnum;
        self.next_seqnum += 1;
        let cmd = proto::CmdUnlink {
            seqnum,
            devid: 0x0001_0001,
            direction: 0,
            ep: 0,
            unlink_seqnum: target_seqnum,
        };
        self.stream
            .write_all(&proto::encode_cmd_unlink(&cmd))
            .await
            .expect("send unlink");

        let mut header = [0u8; proto::URB_HEADER_LEN];
        self.stream.read_exact(&mut header).await.expect("ret unlink");
        proto::decode_ret_unlink(&header).expect("decode ret unlink")
    }

    /// Read one RET_SUBMIT and its IN payload.
    pub async fn read_ret(&mut self) -> (RetSubmit, Vec<u8>) {
        let mut header = [0u8; proto::URB_HEADER_LEN];
        self.stream.read_exact(&mut header).await.expect("ret header");
        let ret = proto::decode_ret_submit(&header).expect("decode ret");
        let mut payload = vec![0u8; ret.actual_length as usize];
        if ret.direction == proto::DIR_IN && ret.actual_length > 0 {
            self.stream.read_exact(&mut payload).await.expect("ret payload");
        } else {
            payload.clear();
        }
        (ret, payload)
    }
}

fn parse_block(block: &[u8; proto::EXPORTED_DEVICE_LEN], interfaces: Vec<(u8, u8, u8)>) -> DevlistEntry {
    let busid_end = block[256..288].iter().position(|&b| b == 0).unwrap_or(32);
    DevlistEntry {
        busid: String::from_utf8_lossy(&block[256..256 + busid_end]).into_owned(),
        busnum: u32::from_be_bytes(block[288..292].try_into().unwrap()),
        devnum: u32::from_be_bytes(block[292..296].try_into().unwrap()),
        id_vendor: u16::from_be_bytes(block[300..302].try_into().unwrap()),
        id_product: u16::from_be_bytes(block[302..304].try_into().unwrap()),
        interfaces,
    }
}

/// Poll an async condition until it holds or the deadline passes.
pub async fn eventually<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
