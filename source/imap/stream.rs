// The transport under the IMAP driver: a TCP connection, optionally wrapped
// in TLS (implicitly or via STARTTLS), or a child process speaking IMAP over
// its stdio (Tunnel). On top of it, a line buffer that hands complete
// responses to the peg parsers; the completeness scan accounts for literals,
// so a parser is never invoked on a partial response.

use anyhow::Context as _;
use std::{
  cell, cmp, io,
  io::{Read as _, Write as _},
  net::{self, ToSocketAddrs as _},
  process, str, time,
};

pub trait ReadWrite {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
  fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

#[ouroboros::self_referencing]
pub struct TlsStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ClientConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl ReadWrite for TlsStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.read(buf))
  }

  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    self.with_mut(|fields| fields.tls_stream.write_all(buf))
  }
}

pub struct Tunnel {
  child: process::Child,
  stdin: process::ChildStdin,
  stdout: process::ChildStdout,
}

impl Drop for Tunnel {
  fn drop(&mut self) {
    let _ = self.child.kill();
    let _ = self.child.wait();
  }
}

impl ReadWrite for Tunnel {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.stdout.read(buf)
  }

  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    self.stdin.write_all(buf)
  }
}

pub enum Wire {
  Closed,
  Plain(net::TcpStream),
  Tls(Box<TlsStream>),
  Tunnel(Tunnel),
}

impl ReadWrite for Wire {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match self {
      Wire::Closed => Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed")),
      Wire::Plain(stream) => stream.read(buf),
      Wire::Tls(stream) => stream.read(buf),
      Wire::Tunnel(tunnel) => tunnel.read(buf),
    }
  }

  fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    match self {
      Wire::Closed => Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed")),
      Wire::Plain(stream) => stream.write_all(buf),
      Wire::Tls(stream) => stream.write_all(buf),
      Wire::Tunnel(tunnel) => tunnel.write_all(buf),
    }
  }
}

pub fn connect_tcp(host: &str, port: u16, timeout: Option<time::Duration>) -> anyhow::Result<net::TcpStream> {
  let address = (host, port)
    .to_socket_addrs()?
    .next()
    .with_context(|| format!("couldn't resolve {host}:{port}"))?;
  log::debug!("connecting to {address:?} with timeout {timeout:?}");
  Ok(match timeout {
    Some(duration) => {
      let stream = net::TcpStream::connect_timeout(&address, duration)?;
      stream.set_read_timeout(Some(duration))?;
      stream
    }
    None => net::TcpStream::connect(address)?,
  })
}

pub fn wrap_tls(tcp_stream: net::TcpStream, host: &str) -> anyhow::Result<TlsStream> {
  let mut root_store = rustls::RootCertStore::empty();
  for certificate in rustls_native_certs::load_native_certs()? {
    root_store.add(&rustls::Certificate(certificate.0))?;
  }
  Ok(
    TlsStreamBuilder {
      tcp_stream,
      tls_connection: rustls::ClientConnection::new(
        std::sync::Arc::new(
          rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
        ),
        host
          .try_into()
          .with_context(|| format!("couldn't convert {host} to server name"))?,
      )?,
      tls_stream_builder: |tcp_stream, tls_connection| rustls::Stream::new(tls_connection, tcp_stream),
    }
    .build(),
  )
}

pub fn spawn_tunnel(command: &str) -> anyhow::Result<Tunnel> {
  log::debug!("spawning tunnel {command:?}");
  let mut child = process::Command::new("sh")
    .arg("-c")
    .arg(command)
    .stdin(process::Stdio::piped())
    .stdout(process::Stdio::piped())
    .spawn()
    .with_context(|| format!("couldn't spawn tunnel {command:?}"))?;
  let stdin = child.stdin.take().unwrap();
  let stdout = child.stdout.take().unwrap();
  Ok(Tunnel { child, stdin, stdout })
}

fn escape(bytes: &[u8]) -> String {
  let mut string = String::new();
  for byte in bytes {
    string += &std::ascii::escape_default(*byte).to_string();
  }
  string
}

fn summarize(bytes: &[u8]) -> String {
  let stop = bytes
    .windows(2)
    .position(|window| window == b"\r\n")
    .unwrap_or(bytes.len());
  let stop = cmp::min(stop + 2, bytes.len());
  let mut string = escape(&bytes[..stop]);
  if stop < bytes.len() {
    string += "...omitted...";
  }
  string
}

pub struct Stream {
  wire: Wire,
  buffer: Vec<u8>,
  end: cell::Cell<usize>,
}

impl Stream {
  pub fn new(wire: Wire) -> Self {
    Self { wire, buffer: Vec::new(), end: cell::Cell::new(0) }
  }

  /// Rewires the transport in place, for STARTTLS.
  pub fn upgrade<F>(&mut self, wrap: F) -> anyhow::Result<()>
  where
    F: FnOnce(Wire) -> anyhow::Result<Wire>,
  {
    self.compact();
    anyhow::ensure!(
      self.buffer.is_empty(),
      "unparsed cleartext left in buffer across a TLS upgrade"
    );
    let wire = std::mem::replace(&mut self.wire, Wire::Closed);
    self.wire = wrap(wire)?;
    Ok(())
  }

  fn compact(&mut self) {
    let end = self.end.get();
    let rest = self.buffer.len() - end;
    self.buffer.copy_within(end.., 0);
    self.buffer.truncate(rest);
    self.end.set(0);
  }

  /// Writes a command; `log` says how many of the buffers may be logged
  /// (0 when the caller already logged a sanitized rendering).
  pub fn input(&mut self, buffers: &[&[u8]], log: usize) -> anyhow::Result<()> {
    self.compact();
    if log::log_enabled!(log::Level::Debug) && log > 0 {
      log::debug!(
        "> {}{}",
        escape(&buffers[..log].concat()),
        if log < buffers.len() { "...omitted..." } else { "" }
      );
    }
    for buffer in buffers.iter() {
      // https://www.rfc-editor.org/rfc/rfc7162#section-4
      // [...] a client should limit the length of the command lines it
      // generates to approximately 8192 octets (including all quoted strings
      // but not including literals).
      self.wire.write_all(buffer)?;
    }
    Ok(())
  }

  fn read_more(&mut self) -> anyhow::Result<usize> {
    let mut buffer = [0; 64 * 1024];
    match self.wire.read(&mut buffer)? {
      0 => anyhow::bail!("end of stream"),
      length => {
        self.buffer.extend_from_slice(&buffer[..length]);
        Ok(length)
      }
    }
  }

  /// Reads until the buffer holds at least one complete response beyond the
  /// parse position: a CRLF-terminated line, plus the payload of every
  /// literal announced by a `{n}` immediately before a line break.
  pub fn ensure_response(&mut self) -> anyhow::Result<()> {
    let mut pos = self.end.get();
    loop {
      let crlf = loop {
        match memchr::memmem::find(&self.buffer[pos..], b"\r\n") {
          Some(index) => break pos + index,
          None => self.read_more().map(|_| ())?,
        }
      };
      match literal_length(&self.buffer[pos..crlf]) {
        Some(length) => {
          let needed = crlf + 2 + length;
          while self.buffer.len() < needed {
            self.read_more()?;
          }
          pos = needed;
        }
        None => return Ok(()),
      }
    }
  }

  fn inner_parse<'a, P, R>(&'a self, parser: P) -> anyhow::Result<R>
  where
    P: Fn(&'a [u8]) -> Result<(usize, R), peg::error::ParseError<<[u8] as ::peg::Parse>::PositionRepr>>,
  {
    let start = self.end.get();
    let buffer = &self.buffer[start..];
    match parser(buffer) {
      Ok((end, result)) => {
        log::trace!("< {}", summarize(&buffer[..end]));
        self.end.set(self.end.get() + end);
        Ok(result)
      }
      Err(error) => {
        log::trace!("<< {:?} {}", error, summarize(buffer));
        Err(error).context(summarize(buffer))?
      }
    }
  }

  pub fn parse<'a, P, R>(&'a self, parser: P) -> anyhow::Result<Option<R>>
  where
    P: Fn(&'a [u8]) -> Result<(usize, R), peg::error::ParseError<<[u8] as ::peg::Parse>::PositionRepr>>,
  {
    match self.inner_parse(parser) {
      Ok(result) => Ok(Some(result)),
      Err(error) => {
        match error.downcast_ref::<peg::error::ParseError<<[u8] as ::peg::Parse>::PositionRepr>>() {
          Some(_) => Ok(None),
          None => Err(error),
        }
      }
    }
  }

  pub fn expect<'a, P, R>(&'a self, parser: P) -> anyhow::Result<R>
  where
    P: Fn(&'a [u8]) -> Result<(usize, R), peg::error::ParseError<<[u8] as ::peg::Parse>::PositionRepr>>,
  {
    self.inner_parse(parser)
  }
}

/// If the line ends in an IMAP literal announcement `{n}`, returns n.
fn literal_length(line: &[u8]) -> Option<usize> {
  if line.last() != Some(&b'}') {
    return None;
  }
  let open = line.iter().rposition(|&byte| byte == b'{')?;
  let digits = &line[open + 1..line.len() - 1];
  if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
    return None;
  }
  str::from_utf8(digits).unwrap().parse().ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn literal_lengths() {
    assert_eq!(None, literal_length(b"* OK ready"));
    assert_eq!(Some(7), literal_length(b"* LIST () \"/\" {7}"));
    assert_eq!(Some(0), literal_length(b"a APPEND {0}"));
    assert_eq!(None, literal_length(b"* OK {not a literal}"));
    assert_eq!(None, literal_length(b"* OK {}"));
  }
}
