//! Codec ids, the mask bit table and the codec registry.
//!
//! Codecs are opaque whole-buffer transforms. Each one runs once on a unit's
//! fully assembled payload; chunking happens afterwards and is independent.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{AgmError, AgmResult};
use crate::schema::{CodecSpec, CommandSpec, ConfigError};

/// Codec identifier stored in bits 3-4 of a unit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CodecId {
    /// Identity transform.
    #[default]
    Raw = 0,
    /// Generic byte compressor.
    Szip = 1,
    /// Indexed-color video codec.
    Tvc = 2,
    /// RLE2 followed by SZIP.
    Srle2 = 3,
}

/// Bits of the unit mask that carry the codec id.
pub const CODEC_MASK: u8 = 0b0001_1000;

/// Canonical codec id -> mask bits table.
const CODEC_MASK_TABLE: [(CodecId, u8); 4] = [
    (CodecId::Raw, 0b0000_0000),
    (CodecId::Szip, 0b0000_1000),
    (CodecId::Tvc, 0b0001_0000),
    (CodecId::Srle2, 0b0001_1000),
];

impl CodecId {
    pub const ALL: [CodecId; 4] = [CodecId::Raw, CodecId::Szip, CodecId::Tvc, CodecId::Srle2];

    pub fn from_u8(v: u8) -> Option<Self> {
        CodecId::ALL.into_iter().find(|id| *id as u8 == v)
    }

    /// Mask bits for this codec.
    pub fn mask_bits(self) -> u8 {
        CODEC_MASK_TABLE
            .iter()
            .find(|(id, _)| *id == self)
            .map(|(_, bits)| *bits)
            .unwrap_or(0)
    }

    /// Recover the codec id from a full unit mask byte.
    pub fn from_mask(mask: u8) -> Option<Self> {
        let bits = mask & CODEC_MASK;
        CODEC_MASK_TABLE
            .iter()
            .find(|(_, b)| *b == bits)
            .map(|(id, _)| *id)
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::Raw => "raw",
            CodecId::Szip => "szip",
            CodecId::Tvc => "tvc",
            CodecId::Srle2 => "srle2",
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A whole-buffer compress/decompress transform.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;
    fn compress(&self, data: &[u8]) -> AgmResult<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> AgmResult<Vec<u8>>;
}

/// Identity codec (id 0).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &str {
        "raw"
    }

    fn compress(&self, data: &[u8]) -> AgmResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> AgmResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Codec backed by a pair of closures.
pub struct FnCodec<C, D> {
    name: String,
    compress: C,
    decompress: D,
}

impl<C, D> FnCodec<C, D>
where
    C: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync,
    D: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, compress: C, decompress: D) -> Self {
        Self {
            name: name.into(),
            compress,
            decompress,
        }
    }
}

impl<C, D> Codec for FnCodec<C, D>
where
    C: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync,
    D: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn compress(&self, data: &[u8]) -> AgmResult<Vec<u8>> {
        (self.compress)(data).map_err(|e| AgmError::codec_failure(&self.name, e))
    }

    fn decompress(&self, data: &[u8]) -> AgmResult<Vec<u8>> {
        (self.decompress)(data).map_err(|e| AgmError::codec_failure(&self.name, e))
    }
}

/// Composite codec: compresses through each stage in order and
/// decompresses in reverse (SRLE2 is RLE2 then SZIP).
pub struct ChainCodec {
    name: String,
    stages: Vec<Arc<dyn Codec>>,
}

impl ChainCodec {
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn Codec>>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }
}

impl Codec for ChainCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn compress(&self, data: &[u8]) -> AgmResult<Vec<u8>> {
        let mut buf = data.to_vec();
        for stage in &self.stages {
            buf = stage.compress(&buf)?;
        }
        Ok(buf)
    }

    fn decompress(&self, data: &[u8]) -> AgmResult<Vec<u8>> {
        let mut buf = data.to_vec();
        for stage in self.stages.iter().rev() {
            buf = stage.decompress(&buf)?;
        }
        Ok(buf)
    }
}

/// Codec that pipes the buffer through an external program.
///
/// The input is written to the child's stdin and the transformed buffer is
/// read back from stdout. A non-zero exit status is a codec failure.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    name: String,
    compress: Vec<String>,
    decompress: Vec<String>,
}

impl CommandCodec {
    pub fn new(name: impl Into<String>, spec: &CommandSpec) -> Result<Self, ConfigError> {
        let name = name.into();
        if spec.compress.is_empty() || spec.decompress.is_empty() {
            return Err(ConfigError::EmptyCodecCommand { codec: name });
        }
        Ok(Self {
            name,
            compress: spec.compress.clone(),
            decompress: spec.decompress.clone(),
        })
    }

    fn run(&self, argv: &[String], input: &[u8]) -> AgmResult<Vec<u8>> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AgmError::codec_failure(&self.name, "empty command"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgmError::codec_failure(&self.name, format!("spawn '{program}': {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgmError::codec_failure(&self.name, "child stdin unavailable"))?;

        // Feed stdin from a second thread so a full stdout pipe cannot deadlock us.
        let (output, write_result) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || {
                let result = stdin.write_all(input);
                drop(stdin);
                result
            });
            let output = child.wait_with_output();
            let write_result = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            (output, write_result)
        });

        let output = match output {
            Ok(output) => output,
            Err(e) => return Err(AgmError::codec_failure(&self.name, format!("wait: {e}"))),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgmError::codec_failure(
                &self.name,
                format!("'{program}' exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        if let Err(e) = write_result
            && e.kind() != io::ErrorKind::BrokenPipe
        {
            return Err(AgmError::codec_failure(&self.name, format!("stdin: {e}")));
        }

        log::debug!(
            "{}: '{}' {} -> {} bytes",
            self.name,
            program,
            input.len(),
            output.stdout.len()
        );
        Ok(output.stdout)
    }
}

impl Codec for CommandCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn compress(&self, data: &[u8]) -> AgmResult<Vec<u8>> {
        self.run(&self.compress, data)
    }

    fn decompress(&self, data: &[u8]) -> AgmResult<Vec<u8>> {
        self.run(&self.decompress, data)
    }
}

/// Maps codec ids to transforms. `Raw` is always present.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<CodecId, Arc<dyn Codec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.codecs.keys().copied().collect();
        ids.sort_by_key(|id| *id as u8);
        f.debug_struct("CodecRegistry").field("codecs", &ids).finish()
    }
}

impl CodecRegistry {
    /// Create a registry containing only the raw codec.
    pub fn new() -> Self {
        let mut codecs: HashMap<CodecId, Arc<dyn Codec>> = HashMap::new();
        codecs.insert(CodecId::Raw, Arc::new(RawCodec));
        Self { codecs }
    }

    /// Build a registry from configured external commands.
    pub fn from_specs(specs: &HashMap<CodecId, CodecSpec>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for (&id, spec) in specs {
            let codec: Arc<dyn Codec> = match spec {
                CodecSpec::Command(cmd) => Arc::new(CommandCodec::new(id.name(), cmd)?),
                CodecSpec::Chain(stages) => {
                    if stages.is_empty() {
                        return Err(ConfigError::EmptyCodecCommand {
                            codec: id.name().to_string(),
                        });
                    }
                    let stages = stages
                        .iter()
                        .enumerate()
                        .map(|(i, s)| {
                            CommandCodec::new(format!("{}[{}]", id.name(), i), s)
                                .map(|c| Arc::new(c) as Arc<dyn Codec>)
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Arc::new(ChainCodec::new(id.name(), stages))
                }
            };
            registry.insert(id, codec)?;
        }
        Ok(registry)
    }

    /// Register a codec for `id`.
    pub fn register(
        &mut self,
        id: CodecId,
        codec: impl Codec + 'static,
    ) -> Result<(), ConfigError> {
        self.insert(id, Arc::new(codec))
    }

    pub fn insert(&mut self, id: CodecId, codec: Arc<dyn Codec>) -> Result<(), ConfigError> {
        if id == CodecId::Raw {
            return Err(ConfigError::RawCodecReserved);
        }
        log::debug!("registered codec {} as '{}'", id, codec.name());
        self.codecs.insert(id, codec);
        Ok(())
    }

    pub fn contains(&self, id: CodecId) -> bool {
        self.codecs.contains_key(&id)
    }

    pub fn get(&self, id: CodecId) -> AgmResult<&Arc<dyn Codec>> {
        self.codecs.get(&id).ok_or(AgmError::UnknownCodec(id))
    }

    pub fn compress(&self, id: CodecId, data: &[u8]) -> AgmResult<Vec<u8>> {
        self.get(id)?.compress(data)
    }

    pub fn decompress(&self, id: CodecId, data: &[u8]) -> AgmResult<Vec<u8>> {
        self.get(id)?.decompress(data)
    }
}
