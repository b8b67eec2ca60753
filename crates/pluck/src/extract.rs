//! Selective extraction of matching entries from image layers.
//!
//! This is the core of the crate. [`apply_layer`] makes a single forward
//! pass over one layer's tar stream, writing the entries that match the
//! caller's rules to the destination directory and draining everything
//! else. [`extract`] runs it over an image's layers in manifest order, so
//! that a path present in several layers ends up with the content of the
//! last layer that carries it, the same result overlay mounting would give.
//!
//! Whiteout markers are deliberately not interpreted: callers name a small
//! set of files that are written wholesale, never deleted, across an
//! image's build history, so last-write-wins over whole files is enough.

use std::io;
use std::path::{Component, Path, PathBuf};

use log::{debug, trace};
use tar::{EntryType, Header, PaxExtensions};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::reference::ImageReference;
use crate::registry::{corrupt_stream, BlobSource};
use crate::rules::MatchRule;
use crate::{Error, Result};

const TAR_BLOCK_SIZE: u64 = 512;
const COPY_BUFFER: usize = 64 * 1024;

/// Whether the extraction driver keeps visiting layers once every rule has
/// already matched.
///
/// [`VisitAll`] reproduces overlay semantics: a later layer's version of a
/// path supersedes an earlier extraction. [`StopAtFirstMatch`] stops as soon
/// as every rule has at least one match, keeping whatever the earliest
/// layers provided.
///
/// [`VisitAll`]: TraversalPolicy::VisitAll
/// [`StopAtFirstMatch`]: TraversalPolicy::StopAtFirstMatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalPolicy {
    /// Visit every layer; the last writer of a path wins.
    #[default]
    VisitAll,
    /// Stop once every rule has matched at least once.
    StopAtFirstMatch,
}

/// Destination paths written by an extraction, grouped per rule.
///
/// A rule with no matches in any layer yields an empty slice; that is a
/// normal outcome which the caller must check, not an error.
#[derive(Debug, Default)]
pub struct ExtractionResult {
    outcomes: Vec<Vec<PathBuf>>,
}

impl ExtractionResult {
    /// The destination paths written for the rule at `index` (in the rule
    /// slice passed to [`extract`]).
    pub fn written(&self, index: usize) -> &[PathBuf] {
        self.outcomes.get(index).map_or(&[], Vec::as_slice)
    }

    /// All destination paths, in rule order.
    pub fn all_written(&self) -> impl Iterator<Item = &PathBuf> {
        self.outcomes.iter().flatten()
    }

    /// True when no rule matched anything.
    pub fn is_empty(&self) -> bool {
        self.outcomes.iter().all(Vec::is_empty)
    }
}

/// One entry written by [`apply_layer`]: the index of the rule that matched
/// and the destination path.
pub type Applied = (usize, PathBuf);

/// Apply one layer's tar stream against the match rules.
///
/// Reads the stream as a sequence of tar entries, in stream order, with no
/// seeking. Matching regular files are written below `dest_dir` (parent
/// directories created, existing files overwritten); matching directories
/// and symlinks are materialized; matching entries of other kinds are
/// skipped. Non-matching entries are drained so the pass can continue. An
/// entry may satisfy several rules and is then written to each rule's
/// rewritten destination.
///
/// A rewritten path that would escape `dest_dir` (a `..` component) is
/// rejected with a write error before anything is written. Partial writes
/// from the failing entry are not rolled back; re-running the extraction
/// overwrites them.
pub async fn apply_layer(
    dest_dir: &Path,
    stream: &mut (impl AsyncRead + Unpin + ?Sized),
    rules: &[MatchRule],
) -> Result<Vec<Applied>> {
    let mut written = Vec::new();

    let mut gnu_longname: Vec<u8> = Vec::new();
    let mut gnu_longlink: Vec<u8> = Vec::new();
    let mut pax_path: Option<Vec<u8>> = None;
    let mut pax_link: Option<Vec<u8>> = None;

    while let Some(header) = read_header(stream).await? {
        if header.as_bytes() == &[0u8; 512] {
            continue;
        }

        let size = header
            .entry_size()
            .map_err(|e| corrupt_stream(format!("bad entry size: {e}")))?;
        let padded = size.next_multiple_of(TAR_BLOCK_SIZE);

        // Path metadata entries amend the entry that follows them.
        match header.entry_type() {
            EntryType::GNULongName => {
                gnu_longname = read_string_entry(stream, size, padded).await?;
                continue;
            }
            EntryType::GNULongLink => {
                gnu_longlink = read_string_entry(stream, size, padded).await?;
                continue;
            }
            EntryType::XHeader => {
                let content = read_content(stream, size, padded).await?;
                for extension in PaxExtensions::new(&content) {
                    let extension =
                        extension.map_err(|e| corrupt_stream(format!("bad PAX record: {e}")))?;
                    let key = extension
                        .key()
                        .map_err(|e| corrupt_stream(format!("bad PAX key: {e}")))?;
                    match key {
                        "path" => pax_path = Some(extension.value_bytes().to_vec()),
                        "linkpath" => pax_link = Some(extension.value_bytes().to_vec()),
                        _ => {}
                    }
                }
                continue;
            }
            EntryType::XGlobalHeader => {
                drain(stream, padded).await?;
                continue;
            }
            _ => {}
        }

        // Accumulated overrides apply to exactly this entry.
        let pax_path = pax_path.take();
        let pax_link = pax_link.take();
        let longname = std::mem::take(&mut gnu_longname);
        let longlink = std::mem::take(&mut gnu_longlink);

        let entry_path = path_for_entry(pax_path, longname, &header);
        let matched: Vec<(usize, String)> = rules
            .iter()
            .enumerate()
            .filter_map(|(index, rule)| rule.matches(&entry_path).map(|p| (index, p)))
            .collect();

        if matched.is_empty() {
            drain(stream, padded).await?;
            continue;
        }
        trace!("entry {entry_path} matches {} rule(s)", matched.len());

        match header.entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                let mode = header
                    .mode()
                    .map_err(|e| corrupt_stream(format!("bad entry mode: {e}")))?;
                for (index, dest) in
                    write_regular(dest_dir, stream, &matched, size, mode).await?
                {
                    written.push((index, dest));
                }
                drain(stream, padded - size).await?;
            }
            EntryType::Directory => {
                for (index, rewritten) in &matched {
                    let dest = safe_join(dest_dir, rewritten)?;
                    fs::create_dir_all(&dest).await.map_err(|source| Error::Write {
                        path: dest.clone(),
                        source,
                    })?;
                    written.push((*index, dest));
                }
                drain(stream, padded).await?;
            }
            EntryType::Symlink => {
                let target = link_target(pax_link, longlink, &header);
                for (index, rewritten) in &matched {
                    let dest = safe_join(dest_dir, rewritten)?;
                    write_symlink(&target, &dest).await?;
                    written.push((*index, dest));
                }
                drain(stream, padded).await?;
            }
            other => {
                // Hardlinks, fifos, devices: nothing useful to materialize.
                debug!("skipping matching entry {entry_path} of type {other:?}");
                drain(stream, padded).await?;
            }
        }
    }

    Ok(written)
}

/// Extract the entries matching `rules` from an image into `dest_dir`.
///
/// Resolves the image's layer list through `source` and applies each layer
/// in manifest order, opening exactly one layer stream at a time and
/// releasing it on every exit path. Under [`TraversalPolicy::VisitAll`] all
/// layers are visited even after every rule has matched, so a later layer's
/// version of a path supersedes an earlier one.
///
/// Cancellation: dropping the returned future abandons the extraction at
/// the next read; a partially written destination file must be treated as
/// invalid and is overwritten by a re-run.
pub async fn extract(
    dest_dir: &Path,
    image: &ImageReference,
    rules: &[MatchRule],
    source: &impl BlobSource,
    policy: TraversalPolicy,
) -> Result<ExtractionResult> {
    let layers = source.list_layers(image).await?;
    debug!("extracting from {image}: {} layers", layers.len());

    let mut outcomes = vec![Vec::new(); rules.len()];
    for layer in &layers {
        trace!("applying layer {}", layer.digest);
        let mut stream = source.open_layer(image, layer).await?;

        match apply_layer(dest_dir, stream.reader(), rules).await {
            Ok(applied) => {
                stream
                    .finish()
                    .await
                    .map_err(|err| err.with_layer_context(image, &layer.digest))?;
                for (index, dest) in applied {
                    let outcome: &mut Vec<PathBuf> = &mut outcomes[index];
                    if !outcome.contains(&dest) {
                        outcome.push(dest);
                    }
                }
            }
            Err(err) => {
                let err = stream.fail(err).await;
                return Err(err.with_layer_context(image, &layer.digest));
            }
        }

        if policy == TraversalPolicy::StopAtFirstMatch
            && !outcomes.iter().any(Vec::is_empty)
        {
            debug!("all rules matched, stopping before layer {}", layer.digest);
            break;
        }
    }

    Ok(ExtractionResult { outcomes })
}

/// Read the next 512-byte header block. A clean EOF at a block boundary
/// ends the archive; EOF inside a block is corruption.
async fn read_header(
    reader: &mut (impl AsyncRead + Unpin + ?Sized),
) -> Result<Option<Header>> {
    let mut header = Header::new_gnu();
    let buf = header.as_mut_bytes();

    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| corrupt_stream(format!("cannot read entry header: {e}")))?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(corrupt_stream("truncated entry header".to_string()))
            };
        }
        filled += n;
    }
    Ok(Some(header))
}

/// Read a whole (small) entry body, returning the unpadded content.
async fn read_content(
    reader: &mut (impl AsyncRead + Unpin + ?Sized),
    size: u64,
    padded: u64,
) -> Result<Vec<u8>> {
    let mut content = vec![0u8; padded as usize];
    reader
        .read_exact(&mut content)
        .await
        .map_err(|e| corrupt_stream(format!("truncated entry body: {e}")))?;
    content.truncate(size as usize);
    Ok(content)
}

/// Read a GNU long-name/long-link body and trim the NUL terminator.
async fn read_string_entry(
    reader: &mut (impl AsyncRead + Unpin + ?Sized),
    size: u64,
    padded: u64,
) -> Result<Vec<u8>> {
    let mut content = read_content(reader, size, padded).await?;
    while content.last() == Some(&0) {
        content.pop();
    }
    Ok(content)
}

/// Skip `count` bytes of the stream.
async fn drain(reader: &mut (impl AsyncRead + Unpin + ?Sized), count: u64) -> Result<()> {
    let copied = tokio::io::copy(&mut reader.take(count), &mut tokio::io::sink())
        .await
        .map_err(|e| corrupt_stream(format!("cannot skip entry body: {e}")))?;
    if copied != count {
        return Err(corrupt_stream("truncated entry body".to_string()));
    }
    Ok(())
}

/// The entry's path: PAX override, then GNU long name, then the header
/// name (with its ustar prefix). Trailing slashes from directory entries
/// are dropped.
fn path_for_entry(pax: Option<Vec<u8>>, gnu: Vec<u8>, header: &Header) -> String {
    let bytes = if let Some(path) = pax {
        path
    } else if !gnu.is_empty() {
        gnu
    } else {
        header.path_bytes().into_owned()
    };

    let mut path = String::from_utf8_lossy(&bytes).into_owned();
    while path.ends_with('/') {
        path.pop();
    }
    path
}

/// The symlink target: PAX `linkpath`, then GNU long link, then the header
/// link-name field.
fn link_target(pax: Option<Vec<u8>>, gnu: Vec<u8>, header: &Header) -> PathBuf {
    let bytes = if let Some(target) = pax {
        target
    } else if !gnu.is_empty() {
        gnu
    } else {
        header
            .link_name_bytes()
            .map(|name| name.into_owned())
            .unwrap_or_default()
    };
    PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
}

/// Join a rewritten entry path onto the destination, rejecting anything
/// that would resolve outside it.
fn safe_join(dest_dir: &Path, rewritten: &str) -> Result<PathBuf> {
    let relative = Path::new(rewritten);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::Write {
                    path: relative.to_path_buf(),
                    source: io::Error::other("path escapes the destination directory"),
                })
            }
        }
    }
    Ok(dest_dir.join(relative))
}

/// Stream one regular file's content to every matching destination.
async fn write_regular(
    dest_dir: &Path,
    stream: &mut (impl AsyncRead + Unpin + ?Sized),
    matched: &[(usize, String)],
    size: u64,
    mode: u32,
) -> Result<Vec<Applied>> {
    let mut files = Vec::with_capacity(matched.len());
    for (index, rewritten) in matched {
        let dest = safe_join(dest_dir, rewritten)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|source| Error::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = fs::File::create(&dest).await.map_err(|source| Error::Write {
            path: dest.clone(),
            source,
        })?;
        files.push((*index, dest, file));
    }

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = stream
            .read(&mut buf[..want])
            .await
            .map_err(|e| corrupt_stream(format!("cannot read entry content: {e}")))?;
        if n == 0 {
            return Err(corrupt_stream("truncated entry content".to_string()));
        }
        for (_, dest, file) in &mut files {
            file.write_all(&buf[..n]).await.map_err(|source| Error::Write {
                path: dest.clone(),
                source,
            })?;
        }
        remaining -= n as u64;
    }

    let mut written = Vec::with_capacity(files.len());
    for (index, dest, mut file) in files {
        file.flush().await.map_err(|source| Error::Write {
            path: dest.clone(),
            source,
        })?;
        drop(file);
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dest, Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(|source| Error::Write {
                    path: dest.clone(),
                    source,
                })?;
        }
        written.push((index, dest));
    }
    Ok(written)
}

/// Materialize a symlink, replacing whatever is already at the
/// destination (layers may ship a path first as a file, later as a link).
async fn write_symlink(target: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await.map_err(|source| Error::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    match fs::remove_file(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(Error::Write {
                path: dest.to_path_buf(),
                source,
            })
        }
    }
    fs::symlink(target, dest).await.map_err(|source| Error::Write {
        path: dest.to_path_buf(),
        source,
    })
}
