use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

use super::ClassifierError;

const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// One persistent line-protocol connection to the classifier.
///
/// Requests go out terminated by CRLF, responses come back terminated by LF.
pub struct ClassifierConnection {
    id: u64,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ClassifierConnection {
    pub async fn dial(address: &str, id: u64) -> Result<Self, ClassifierError> {
        let stream = TcpStream::connect(address).await.map_err(|err| {
            ClassifierError::Connection(format!("failed to connect to {address}: {err}"))
        })?;
        if let Err(err) = stream.set_nodelay(true) {
            log_debug!("connection #{id} to {address}: TCP_NODELAY not set: {err}");
        }

        let (reader, writer) = stream.into_split();
        Ok(Self {
            id,
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn round_trip(&mut self, query: &str) -> Result<String, ClassifierError> {
        self.writer.write_all(query.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 || !line.ends_with('\n') {
            return Err(ClassifierError::Connection(
                "connection closed before a full response line".into(),
            ));
        }

        Ok(line.trim_end_matches(|c: char| c == '\r' || c == '\n').to_string())
    }
}
