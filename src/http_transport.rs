//! An HTTP transport for the flag service built on `reqwest`.
use std::{sync::Mutex, time::Duration};

use reqwest::{header, StatusCode};
use tokio::sync::oneshot;

use crate::transport::{FetchResponse, StreamEvent, StreamSink, Transport, TransportRequest};
use crate::{Result, TransportError};

/// [`Transport`] implementation talking to the flag service over HTTP and Server-Sent Events.
///
/// The stream handshake answering `404 Not Found` or `405 Method Not Allowed` is reported as
/// [`TransportError::StreamingUnavailable`], which makes the client poll for the rest of the
/// session.
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    fetch_client: reqwest::blocking::Client,
    connect_timeout: Duration,
    /// Cancels the stream opened last. Dropping the sender tears the connection down.
    active_stream: Mutex<Option<oneshot::Sender<()>>>,
}

impl HttpTransport {
    /// Default value for the `connect_timeout` of [`HttpTransport::new`].
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a new transport. `connect_timeout` applies to both fetches and stream handshakes;
    /// fetches additionally time out after `connect_timeout` of total request time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClient`](crate::Error::HttpClient) if the TLS backend or the system
    /// configuration could not be loaded.
    pub fn new(connect_timeout: Duration) -> Result<HttpTransport> {
        let fetch_client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout)
            .build()?;

        Ok(HttpTransport {
            fetch_client,
            connect_timeout,
            active_stream: Mutex::new(None),
        })
    }

    fn replace_active_stream(&self, cancel: Option<oneshot::Sender<()>>) {
        let previous = std::mem::replace(
            &mut *self
                .active_stream
                .lock()
                .expect("thread holding stream lock should not panic"),
            cancel,
        );
        if previous.is_some() {
            log::debug!(target: "flagsync", "closing stream");
        }
    }
}

impl Transport for HttpTransport {
    fn open_stream(
        &self,
        request: &TransportRequest,
        sink: StreamSink,
    ) -> std::result::Result<(), TransportError> {
        let (cancel, cancelled) = oneshot::channel();
        self.replace_active_stream(Some(cancel));

        let request = request.clone();
        let connect_timeout = self.connect_timeout;
        std::thread::Builder::new()
            .name("flagsync-stream".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        sink.send(StreamEvent::Error(TransportError::Network(err.to_string())));
                        return;
                    }
                };

                runtime.block_on(async {
                    tokio::select! {
                        _ = cancelled => {
                            log::debug!(target: "flagsync", "stream closed locally");
                        }
                        result = read_stream(&request, connect_timeout, &sink) => {
                            if let Err(err) = result {
                                sink.send(StreamEvent::Error(err));
                            }
                        }
                    }
                });
                // Dropping the runtime drops the connection along with it.
            })
            .map_err(|err| TransportError::Network(err.to_string()))?;

        Ok(())
    }

    fn close_stream(&self) {
        self.replace_active_stream(None);
    }

    fn fetch(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<FetchResponse, TransportError> {
        log::debug!(target: "flagsync", "fetching flags");
        let mut builder = self.fetch_client.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(etag) = &request.etag {
            builder = builder.header(header::IF_NONE_MATCH, etag.as_str());
        }

        let response = builder.send()?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(FetchResponse::NotModified),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                let body = response.text()?;
                log::debug!(target: "flagsync", "successfully fetched flags");
                Ok(FetchResponse::Flags { body, etag })
            }
            status => {
                log::warn!(target: "flagsync", "received non-200 response while fetching flags: {:?}", status);
                Err(TransportError::Status(status.as_u16()))
            }
        }
    }
}

/// Connect and forward parsed events to `sink` until the server closes the stream.
async fn read_stream(
    request: &TransportRequest,
    connect_timeout: Duration,
    sink: &StreamSink,
) -> std::result::Result<(), TransportError> {
    // Streams are long-lived, so no total timeout here.
    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()?;
    let mut builder = client
        .get(request.url.clone())
        .header(header::ACCEPT, "text/event-stream");
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    log::debug!(target: "flagsync", "opening stream");
    let mut response = builder.send().await?;
    match response.status() {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
            return Err(TransportError::StreamingUnavailable)
        }
        status => return Err(TransportError::Status(status.as_u16())),
    }
    if !sink.send(StreamEvent::Open) {
        return Ok(());
    }

    let mut parser = SseParser::new();
    let mut buffer = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        buffer.extend_from_slice(&chunk);
        while let Some(end) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..end]);
            if let Some(event) = parser.push_line(&line) {
                if !sink.send(event) {
                    return Ok(());
                }
            }
        }
    }

    sink.send(StreamEvent::Closed);
    Ok(())
}

/// Incremental parser for the `text/event-stream` format.
///
/// Feed it one line at a time (without the trailing newline). A blank line completes an event.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> SseParser {
        SseParser::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<StreamEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return Some(StreamEvent::Heartbeat);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            // `id` and `retry` are not used: reconnect policy belongs to the data source.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data).join("\n");
        match event.as_deref() {
            Some("put") => Some(StreamEvent::Put(data)),
            Some("patch") => Some(StreamEvent::Patch(data)),
            Some("delete") => Some(StreamEvent::Delete(data)),
            Some("ping") => Some(StreamEvent::Ping),
            None if data.is_empty() => None,
            other => {
                log::debug!(target: "flagsync", "ignoring unknown stream event: {:?}", other);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{ErrorKind, Read, Write},
        net::{TcpListener, TcpStream},
        sync::mpsc::{self, Receiver},
        thread::JoinHandle,
        time::Duration,
    };

    use url::Url;

    use super::{HttpTransport, SseParser};
    use crate::{
        data_source::Message,
        transport::{FetchResponse, StreamEvent, StreamSink, Transport, TransportRequest},
        TransportError,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn parse(input: &str) -> Vec<StreamEvent> {
        let mut parser = SseParser::new();
        input.lines().filter_map(|line| parser.push_line(line)).collect()
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(TIMEOUT).unwrap()
    }

    fn request(url: Url, etag: Option<&str>) -> TransportRequest {
        TransportRequest {
            url,
            headers: vec![("Authorization".to_owned(), "api_key env-key".to_owned())],
            etag: etag.map(str::to_owned),
        }
    }

    fn read_head(socket: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte).unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap().to_ascii_lowercase()
    }

    /// Accept one connection, answer with `response` and hand the socket to `then`. Returns the
    /// URL to connect to and the request head (lowercased) along with the result of `then`.
    fn serve_once<T: Send + 'static>(
        response: impl Into<String>,
        then: impl FnOnce(TcpStream) -> T + Send + 'static,
    ) -> (Url, JoinHandle<(String, T)>) {
        let response = response.into();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("http://{}/flags", listener.local_addr().unwrap())).unwrap();
        let handle = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let head = read_head(&mut socket);
            socket.write_all(response.as_bytes()).unwrap();
            socket.flush().unwrap();
            (head, then(socket))
        });
        (url, handle)
    }

    fn next_event(receiver: &Receiver<Message>) -> StreamEvent {
        match receiver.recv_timeout(TIMEOUT).expect("stream event should arrive") {
            Message::Stream { event, .. } => event,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_flag_events() {
        let events = parse(
            "event: put\ndata: {\"a\": {\"value\": true}}\n\n\
             event: patch\ndata: {\"key\": \"a\",\ndata: \"version\": 2}\n\n\
             event: delete\ndata: {\"key\": \"a\", \"version\": 3}\n\n\
             event: ping\n\n",
        );

        assert_eq!(
            events,
            vec![
                StreamEvent::Put("{\"a\": {\"value\": true}}".into()),
                StreamEvent::Patch("{\"key\": \"a\",\n\"version\": 2}".into()),
                StreamEvent::Delete("{\"key\": \"a\", \"version\": 3}".into()),
                StreamEvent::Ping,
            ]
        );
    }

    #[test]
    fn comments_are_heartbeats() {
        assert_eq!(parse(":\n"), vec![StreamEvent::Heartbeat]);
    }

    #[test]
    fn ignores_unknown_events_and_stray_blank_lines() {
        let events = parse("\n\nevent: unknown\ndata: x\n\nid: 5\nretry: 100\n\nevent: ping\r\n\r\n");

        assert_eq!(events, vec![StreamEvent::Ping]);
    }

    #[test]
    fn fetch_sends_etag_and_captures_the_new_one() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             ETag: \"v2\"\r\n\
             Content-Length: 22\r\n\
             Connection: close\r\n\r\n\
             {\"a\": {\"value\": true}}",
            |_| (),
        );

        let response = transport().fetch(&request(url, Some("\"v1\""))).unwrap();

        assert_eq!(
            response,
            FetchResponse::Flags {
                body: "{\"a\": {\"value\": true}}".to_owned(),
                etag: Some("\"v2\"".to_owned()),
            }
        );
        let (head, ()) = server.join().unwrap();
        assert!(head.starts_with("get /flags "), "{head}");
        assert!(head.contains("if-none-match: \"v1\""), "{head}");
        assert!(head.contains("authorization: api_key env-key"), "{head}");
    }

    #[test]
    fn fetch_maps_not_modified() {
        let (url, server) = serve_once(
            "HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\nConnection: close\r\n\r\n",
            |_| (),
        );

        let response = transport().fetch(&request(url, Some("\"v1\""))).unwrap();

        assert_eq!(response, FetchResponse::NotModified);
        server.join().unwrap();
    }

    #[test]
    fn fetch_maps_error_statuses() {
        for (status, code) in [("401 Unauthorized", 401), ("500 Internal Server Error", 500)] {
            let (url, server) = serve_once(
                format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"),
                |_| (),
            );

            let result = transport().fetch(&request(url, None));

            assert_eq!(result, Err(TransportError::Status(code)));
            server.join().unwrap();
        }
    }

    #[test]
    fn stream_delivers_events_until_server_closes() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/event-stream\r\n\
             Connection: close\r\n\r\n\
             event: put\ndata: {}\n\n",
            drop,
        );
        let (sender, receiver) = mpsc::channel();
        let transport = transport();

        transport
            .open_stream(&request(url, None), StreamSink::new(1, sender))
            .unwrap();

        assert_eq!(next_event(&receiver), StreamEvent::Open);
        assert_eq!(next_event(&receiver), StreamEvent::Put("{}".into()));
        assert_eq!(next_event(&receiver), StreamEvent::Closed);
        let (head, ()) = server.join().unwrap();
        assert!(head.contains("accept: text/event-stream"), "{head}");
    }

    #[test]
    fn missing_stream_endpoint_is_streaming_unavailable() {
        let (url, server) = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            |_| (),
        );
        let (sender, receiver) = mpsc::channel();
        let transport = transport();

        transport
            .open_stream(&request(url, None), StreamSink::new(1, sender))
            .unwrap();

        assert_eq!(
            next_event(&receiver),
            StreamEvent::Error(TransportError::StreamingUnavailable)
        );
        server.join().unwrap();
    }

    #[test]
    fn close_stream_closes_the_connection() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n: hello\n\n",
            |mut socket| {
                socket.set_read_timeout(Some(TIMEOUT)).unwrap();
                let mut buf = [0u8; 16];
                match socket.read(&mut buf) {
                    Ok(0) => true,
                    Err(err) => err.kind() == ErrorKind::ConnectionReset,
                    Ok(_) => false,
                }
            },
        );
        let (sender, receiver) = mpsc::channel();
        let transport = transport();

        transport
            .open_stream(&request(url, None), StreamSink::new(1, sender))
            .unwrap();
        assert_eq!(next_event(&receiver), StreamEvent::Open);
        assert_eq!(next_event(&receiver), StreamEvent::Heartbeat);

        transport.close_stream();

        let (_, closed) = server.join().unwrap();
        assert!(closed, "connection should be closed by the client");
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
