//! Typed command surface.
//!
//! One method per verb understood by the companion interpreter. Each call
//! encodes its arguments positionally, registers for the response, and sends
//! the message as one step under the channel's call lock. The returned
//! [`ResponseHandle`] is awaited separately, with or without a timeout.
//!
//! | verb | request payload | response |
//! |------|-----------------|----------|
//! | `getpid` | - | int |
//! | `execute` | string source | string stdout, string stderr |
//! | `putFlowVariables`, `putTable`, `appendToTable`, `putObject`, `putSql` | string name, bytes data | `success` |
//! | `getFlowVariables`, `getTable`, `getImage`, `getObject` | string name | bytes |
//! | `getTableChunk` | string name, int start, int end | bytes |
//! | `listVariables` | - | bytes |
//! | `getSql` | string name | string |
//! | `getTableSize` | string name | int |
//! | `reset`, `shutdown` | - | `success` |
//! | `hasAutoComplete` | - | int (0/1) |
//! | `autoComplete` | string source, int line, int column | raw payload |
//! | `addSerializer` | string id, string type, string path | `success` |
//! | `addDeserializer` | string id, string path | `success` |
//! | `setCustomModulePaths` | string paths | none |
//!
//! # Example
//!
//! ```ignore
//! let commands = channel.commands();
//! let output = commands.execute("print('hi')").await?.get().await?;
//! assert_eq!(output.stdout, "hi\n");
//! ```

use bytes::Bytes;

use crate::client::Channel;
use crate::codec::{PayloadDecoder, PayloadEncoder};
use crate::error::Result;
use crate::message::MessageId;
use crate::pending::ResponseHandle;

/// Output captured while executing source code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecuteOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Typed façade over a [`Channel`].
#[derive(Clone, Debug)]
pub struct Commands {
    channel: Channel,
}

impl Commands {
    /// Wrap a channel.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Ask for the companion's process id.
    pub async fn get_pid(&self) -> Result<ResponseHandle<i32>> {
        self.channel.request("getpid", None, decode_int).await
    }

    /// Execute source code and capture its output.
    pub async fn execute(&self, source: &str) -> Result<ResponseHandle<ExecuteOutput>> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(source)?;

        self.channel
            .request("execute", Some(payload.finish()), |bytes| {
                let mut decoder = PayloadDecoder::new(bytes);
                Ok(ExecuteOutput {
                    stdout: decoder.next_string()?,
                    stderr: decoder.next_string()?,
                })
            })
            .await
    }

    /// Store serialized flow variables under `name`.
    pub async fn put_flow_variables(&self, name: &str, data: &[u8]) -> Result<ResponseHandle<()>> {
        self.put("putFlowVariables", name, data).await
    }

    /// Fetch serialized flow variables stored under `name`.
    pub async fn get_flow_variables(&self, name: &str) -> Result<ResponseHandle<Bytes>> {
        self.get_bytes("getFlowVariables", name).await
    }

    /// Store a serialized table under `name`.
    pub async fn put_table(&self, name: &str, table: &[u8]) -> Result<ResponseHandle<()>> {
        self.put("putTable", name, table).await
    }

    /// Append a serialized table chunk to the table stored under `name`.
    pub async fn append_to_table(&self, name: &str, table: &[u8]) -> Result<ResponseHandle<()>> {
        self.put("appendToTable", name, table).await
    }

    /// Ask for the row count of the table stored under `name`.
    pub async fn get_table_size(&self, name: &str) -> Result<ResponseHandle<i32>> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(name)?;
        self.channel
            .request("getTableSize", Some(payload.finish()), decode_int)
            .await
    }

    /// Fetch the serialized table stored under `name`.
    pub async fn get_table(&self, name: &str) -> Result<ResponseHandle<Bytes>> {
        self.get_bytes("getTable", name).await
    }

    /// Fetch rows `start..=end` of the table stored under `name`.
    pub async fn get_table_chunk(
        &self,
        name: &str,
        start: i32,
        end: i32,
    ) -> Result<ResponseHandle<Bytes>> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(name)?.put_int(start).put_int(end);
        self.channel
            .request("getTableChunk", Some(payload.finish()), decode_bytes)
            .await
    }

    /// Fetch the serialized list of workspace variables.
    pub async fn list_variables(&self) -> Result<ResponseHandle<Bytes>> {
        self.channel.request("listVariables", None, decode_bytes).await
    }

    /// Clear the companion's workspace.
    pub async fn reset(&self) -> Result<ResponseHandle<()>> {
        self.channel.send_acknowledged("reset", None, true).await
    }

    /// Ask whether the companion supports autocompletion.
    pub async fn has_auto_complete(&self) -> Result<ResponseHandle<bool>> {
        self.channel
            .request("hasAutoComplete", None, |bytes| Ok(decode_int(bytes)? > 0))
            .await
    }

    /// Request completion suggestions at `line`/`column` of `source`.
    ///
    /// The response payload is returned undecoded.
    pub async fn auto_complete(
        &self,
        source: &str,
        line: i32,
        column: i32,
    ) -> Result<ResponseHandle<Bytes>> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(source)?.put_int(line).put_int(column);
        self.channel
            .request("autoComplete", Some(payload.finish()), Ok)
            .await
    }

    /// Fetch the image stored under `name`.
    pub async fn get_image(&self, name: &str) -> Result<ResponseHandle<Bytes>> {
        self.get_bytes("getImage", name).await
    }

    /// Fetch the serialized object stored under `name`.
    pub async fn get_object(&self, name: &str) -> Result<ResponseHandle<Bytes>> {
        self.get_bytes("getObject", name).await
    }

    /// Store a serialized object under `name`.
    pub async fn put_object(&self, name: &str, object: &[u8]) -> Result<ResponseHandle<()>> {
        self.put("putObject", name, object).await
    }

    /// Register a type serializer found at `path`.
    pub async fn add_serializer(
        &self,
        id: &str,
        type_name: &str,
        path: &str,
    ) -> Result<ResponseHandle<()>> {
        let mut payload = PayloadEncoder::new();
        payload
            .put_string(id)?
            .put_string(type_name)?
            .put_string(path)?;
        self.channel
            .send_acknowledged("addSerializer", Some(payload.finish()), false)
            .await
    }

    /// Register a type deserializer found at `path`.
    pub async fn add_deserializer(&self, id: &str, path: &str) -> Result<ResponseHandle<()>> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(id)?.put_string(path)?;
        self.channel
            .send_acknowledged("addDeserializer", Some(payload.finish()), false)
            .await
    }

    /// Store database connection settings and a query under `name`.
    pub async fn put_sql(&self, name: &str, sql: &[u8]) -> Result<ResponseHandle<()>> {
        self.put("putSql", name, sql).await
    }

    /// Fetch the query stored under `name`.
    pub async fn get_sql(&self, name: &str) -> Result<ResponseHandle<String>> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(name)?;
        self.channel
            .request("getSql", Some(payload.finish()), |bytes| {
                PayloadDecoder::new(bytes).next_string()
            })
            .await
    }

    /// Ask the companion to shut down.
    ///
    /// From this point on a failing read ends the channel cleanly.
    pub async fn shutdown(&self) -> Result<ResponseHandle<()>> {
        self.channel.mark_shutdown_initiated();
        self.channel.send_acknowledged("shutdown", None, true).await
    }

    /// Set additional module search paths. No response is expected.
    pub async fn set_custom_module_paths(&self, paths: &str) -> Result<MessageId> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(paths)?;
        self.channel
            .notify("setCustomModulePaths", Some(payload.finish()))
            .await
    }

    async fn put(&self, command: &str, name: &str, data: &[u8]) -> Result<ResponseHandle<()>> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(name)?.put_bytes(data)?;
        self.channel
            .send_acknowledged(command, Some(payload.finish()), false)
            .await
    }

    async fn get_bytes(&self, command: &str, name: &str) -> Result<ResponseHandle<Bytes>> {
        let mut payload = PayloadEncoder::new();
        payload.put_string(name)?;
        self.channel
            .request(command, Some(payload.finish()), decode_bytes)
            .await
    }
}

fn decode_int(payload: Bytes) -> Result<i32> {
    PayloadDecoder::new(payload).next_int()
}

fn decode_bytes(payload: Bytes) -> Result<Bytes> {
    PayloadDecoder::new(payload).next_bytes()
}
