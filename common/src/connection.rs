use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, MessageType, HEADER_LEN, MAX_FRAME_LEN};

/// Tope de bytes pedidos al socket en una sola lectura.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Lectura de 0 bytes: el otro extremo cerró.
    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Lado de lectura de una conexión: arma mensajes de a pedazos.
///
/// Primero acumula los 5 bytes de header, después exactamente `length`
/// bytes de body. Al completar un mensaje los buffers vuelven a cero.
#[derive(Debug)]
pub struct FrameReader {
    header: [u8; HEADER_LEN],
    header_len: usize,
    kind: Option<MessageType>,
    remaining: usize,
    body: Vec<u8>,
    scratch: Vec<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            header: [0; HEADER_LEN],
            header_len: 0,
            kind: None,
            remaining: 0,
            body: Vec::new(),
            scratch: vec![0; READ_CHUNK],
        }
    }

    /// Cuántos bytes faltan para la etapa actual (header o body).
    pub fn wanted(&self) -> usize {
        if self.header_len < HEADER_LEN {
            HEADER_LEN - self.header_len
        } else {
            self.remaining
        }
    }

    fn reset(&mut self) {
        self.header_len = 0;
        self.kind = None;
        self.remaining = 0;
        self.body = Vec::new();
    }

    /// Consume como máximo `wanted()` bytes de `data`.
    /// Devuelve cuántos bytes usó y el mensaje si quedó completo.
    pub fn push(&mut self, data: &[u8]) -> Result<(usize, Option<Message>), ConnectionError> {
        let mut used = 0;

        if self.header_len < HEADER_LEN {
            let take = (HEADER_LEN - self.header_len).min(data.len());
            self.header[self.header_len..self.header_len + take].copy_from_slice(&data[..take]);
            self.header_len += take;
            used += take;

            if self.header_len < HEADER_LEN {
                return Ok((used, None));
            }

            let kind = MessageType::from_byte(self.header[0]).ok_or_else(|| {
                ConnectionError::Framing(format!("unknown message type {}", self.header[0]))
            })?;
            let len = u32::from_be_bytes([
                self.header[1],
                self.header[2],
                self.header[3],
                self.header[4],
            ]);
            if len > MAX_FRAME_LEN {
                return Err(ConnectionError::Framing(format!(
                    "frame length {len} exceeds {MAX_FRAME_LEN}"
                )));
            }
            self.kind = Some(kind);
            self.remaining = len as usize;
            self.body = Vec::with_capacity(self.remaining);
        }

        let take = self.remaining.min(data.len() - used);
        self.body.extend_from_slice(&data[used..used + take]);
        self.remaining -= take;
        used += take;

        if self.remaining > 0 {
            return Ok((used, None));
        }

        let kind = self
            .kind
            .ok_or_else(|| ConnectionError::Framing("body without header".to_string()))?;
        let message = Message {
            kind,
            body: std::mem::take(&mut self.body),
        };
        self.reset();
        Ok((used, Some(message)))
    }

    /// Una sola lectura del socket. `Ok(None)` = mensaje todavía incompleto.
    pub async fn receive<R>(&mut self, reader: &mut R) -> Result<Option<Message>, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let want = self.wanted().clamp(1, READ_CHUNK);
        let mut scratch = std::mem::take(&mut self.scratch);
        // una lectura cancelada a mitad puede haber dejado el buffer vacío
        if scratch.len() < READ_CHUNK {
            scratch.resize(READ_CHUNK, 0);
        }
        let read = reader.read(&mut scratch[..want]).await;
        let result = match read {
            Ok(0) => Err(ConnectionError::PeerDisconnected),
            Ok(n) => self.push(&scratch[..n]).map(|(_, msg)| msg),
            Err(e) => Err(ConnectionError::Io(e)),
        };
        self.scratch = scratch;
        result
    }

    /// Lee hasta tener un mensaje completo.
    pub async fn next_message<R>(&mut self, reader: &mut R) -> Result<Message, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(msg) = self.receive(reader).await? {
                return Ok(msg);
            }
        }
    }
}

/// Escritura no bloqueante: escribe lo que el transporte acepte y
/// devuelve `WouldBlock` cuando no acepta nada más.
pub trait TryWrite {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl TryWrite for tokio::net::tcp::OwnedWriteHalf {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::tcp::OwnedWriteHalf::try_write(self, buf)
    }
}

impl TryWrite for tokio::net::TcpStream {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_write(self, buf)
    }
}

/// Lado de escritura: buffer de salida que tolera escrituras parciales.
#[derive(Debug, Default)]
pub struct FrameWriter {
    outbound: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, message: &Message) {
        self.outbound.extend_from_slice(&message.encode());
    }

    pub fn needs_flush(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn pending_bytes(&self) -> &[u8] {
        &self.outbound
    }

    /// Saca del buffer todo lo pendiente sin escribirlo (usado por tests
    /// y por quien quiera inspeccionar lo encolado).
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    /// Escribe todo lo que el transporte acepte ahora.
    /// `Ok(true)` si el buffer quedó vacío; `Ok(false)` si queda resto
    /// para la próxima oportunidad.
    pub fn flush<W>(&mut self, writer: &W) -> Result<bool, ConnectionError>
    where
        W: TryWrite + ?Sized,
    {
        while !self.outbound.is_empty() {
            match writer.try_write(&self.outbound) {
                Ok(0) => return Err(ConnectionError::PeerDisconnected),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Io(e)),
            }
        }
        Ok(true)
    }

    /// Variante async para procesos que pueden esperar al socket (worker, client).
    pub async fn flush_all<W>(&mut self, writer: &mut W) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.outbound);
        writer.write_all(&pending).await?;
        writer.flush().await?;
        Ok(())
    }
}
