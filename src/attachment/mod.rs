//! Attachment sources.
//!
//! An [`Attachment`] exposes a readable stream plus a display name. Two
//! sources are provided:
//! - [`MemoryAttachment`]: an in-memory buffer
//! - [`FileAttachment`]: a file on disk, opened on first read

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::errors::{DispatchError, DispatchResult};
use crate::types::MailAttachment;

/// Content that can be attached to a message.
pub trait Attachment: Send + Sync + fmt::Debug {
    /// Returns a reader positioned at the start of the content.
    fn open(&mut self) -> io::Result<&mut dyn Read>;

    /// Display name used in the MIME headers.
    fn name(&self) -> &str;

    /// MIME content type; guessed from the name by default.
    fn content_type(&self) -> String {
        mime_guess::from_path(self.name())
            .first_or_octet_stream()
            .to_string()
    }
}

/// Reads an attachment fully into a [`MailAttachment`].
///
/// A content type that does not parse is replaced by the one guessed from
/// the name.
pub fn materialize(attachment: &mut dyn Attachment) -> DispatchResult<MailAttachment> {
    let name = attachment.name().to_string();
    let declared = attachment.content_type();
    let content_type = match declared.parse::<::mime::Mime>() {
        Ok(parsed) => parsed.to_string(),
        Err(error) => {
            tracing::warn!(attachment = %name, content_type = %declared, error = %error, "Invalid attachment content type");
            mime_guess::from_path(&name).first_or_octet_stream().to_string()
        }
    };

    let mut data = Vec::new();
    attachment
        .open()
        .and_then(|reader| reader.read_to_end(&mut data))
        .map_err(|source| DispatchError::Attachment {
            name: name.clone(),
            source,
        })?;

    Ok(MailAttachment { name, content_type, data })
}

/// Attachment backed by an in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemoryAttachment {
    name: String,
    content_type: Option<String>,
    cursor: Cursor<Vec<u8>>,
}

impl MemoryAttachment {
    /// Creates a memory attachment.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            cursor: Cursor::new(data.into()),
        }
    }

    /// Overrides the guessed content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl Attachment for MemoryAttachment {
    fn open(&mut self) -> io::Result<&mut dyn Read> {
        self.cursor.set_position(0);
        Ok(&mut self.cursor)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn content_type(&self) -> String {
        match &self.content_type {
            Some(ct) => ct.clone(),
            None => mime_guess::from_path(&self.name).first_or_octet_stream().to_string(),
        }
    }
}

/// Attachment backed by a file.
///
/// The file must exist when the attachment is created; it is opened on the
/// first read and the handle is kept until the attachment is dropped.
pub struct FileAttachment {
    path: PathBuf,
    name: String,
    reader: Option<BufReader<File>>,
}

impl FileAttachment {
    /// Creates a file attachment named after the file.
    ///
    /// Fails with [`io::ErrorKind::NotFound`] if the path is not a file.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::with_name(path, name)
    }

    /// Creates a file attachment with a custom display name.
    pub fn with_name(path: impl AsRef<Path>, name: impl Into<String>) -> io::Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("attachment file not found: {}", path.display()),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            name: name.into(),
            reader: None,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true once the file has been opened.
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }
}

impl fmt::Debug for FileAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAttachment")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("open", &self.reader.is_some())
            .finish()
    }
}

impl Attachment for FileAttachment {
    fn open(&mut self) -> io::Result<&mut dyn Read> {
        let reader = match self.reader.take() {
            Some(mut reader) => {
                reader.seek(SeekFrom::Start(0))?;
                reader
            }
            None => BufReader::new(File::open(&self.path)?),
        };
        Ok(self.reader.insert(reader))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
