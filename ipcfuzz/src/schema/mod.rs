//! The compiled schema set: every message a captured frame can be typed
//! against, and the request path → method descriptor lookup.

use std::path::{Path, PathBuf};

use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor};

use crate::Error;

/// A compiled set of schema files, shared by the decoder, the analyzer and
/// the mutator. Descriptors are cheap handles into the pool.
#[derive(Debug, Clone)]
pub struct SchemaSet {
    pool: DescriptorPool,
}

impl SchemaSet {
    /// Compiles every `.proto` file under `proto_dir` against the given
    /// include directories.
    pub fn compile(proto_dir: &Path, include_dirs: &[PathBuf]) -> Result<Self, Error> {
        let mut files = Vec::new();
        collect_proto_files(proto_dir, include_dirs, &mut files)?;
        if files.is_empty() {
            return Err(Error::BadSchema(format!(
                "no .proto files under {}",
                proto_dir.display()
            )));
        }

        let mut includes: Vec<PathBuf> = vec![proto_dir.to_path_buf()];
        includes.extend(include_dirs.iter().cloned());

        let fds = protox::compile(&files, &includes)
            .map_err(|err| Error::BadSchema(format!("{err}")))?;
        let pool = DescriptorPool::from_file_descriptor_set(fds)
            .map_err(|err| Error::BadSchema(format!("{err}")))?;

        Ok(Self { pool })
    }

    /// A schema set over an already-built descriptor pool
    #[must_use]
    pub fn from_pool(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    /// Resolves a request path like `pkg.Service/Method` (leading slash
    /// tolerated, dot separator tolerated) to its method descriptor.
    /// The first match across all compiled files wins.
    #[must_use]
    pub fn find_method(&self, path: &str) -> Option<MethodDescriptor> {
        let symbol = path.trim_start_matches('/');
        let (service_name, method_name) = if let Some(pos) = symbol.rfind('/') {
            (&symbol[..pos], &symbol[pos + 1..])
        } else {
            let pos = symbol.rfind('.')?;
            (&symbol[..pos], &symbol[pos + 1..])
        };

        self.pool
            .services()
            .find(|svc| svc.full_name() == service_name)
            .and_then(|svc| svc.methods().find(|m| m.name() == method_name))
    }

    /// Looks a message type up by full name.
    #[must_use]
    pub fn message_by_name(&self, name: &str) -> Option<MessageDescriptor> {
        self.pool.get_message_by_name(name)
    }

    /// Types raw payload bytes against the given descriptor.
    pub fn decode(
        &self,
        descriptor: &MessageDescriptor,
        payload: &[u8],
    ) -> Result<DynamicMessage, Error> {
        DynamicMessage::decode(descriptor.clone(), payload)
            .map_err(|err| Error::Serialize(format!("{err}")))
    }
}

fn collect_proto_files(
    dir: &Path,
    skip_dirs: &[PathBuf],
    out: &mut Vec<PathBuf>,
) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            // Include directories live under the proto root in some layouts;
            // their files are only pulled in through imports.
            if skip_dirs.iter().any(|skip| skip.as_path() == path) {
                continue;
            }
            collect_proto_files(&path, skip_dirs, out)?;
        } else if path.extension().is_some_and(|ext| ext == "proto") {
            out.push(path);
        }
    }
    Ok(())
}
