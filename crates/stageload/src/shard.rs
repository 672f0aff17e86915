//! Round-robin sharded gzip buffers
//!
//! Records are spread over a fixed number of shards. Each shard is a gzip
//! encoder writing into its own local temporary file; the files are uploaded
//! as one staged batch once input ends.
//!
//! The shard cursor is pre-incremented before every selection, so with N
//! shards the first record lands in shard `1 % N`, then `2 % N`, and so on.

use flate2::{write::GzEncoder, Compression};
use futures::future::try_join_all;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use stageload_common::types::{to_ndjson_line, Record};

use crate::error::PipelineError;

/// Where a shard's compressed bytes go; the temp file outside of tests.
type ShardSink = Box<dyn Write + Send>;

struct Shard {
    index: usize,
    encoder: GzEncoder<ShardSink>,
    file: NamedTempFile,
    records: u64,
    bytes: u64,
}

impl Shard {
    fn create(index: usize, staging_dir: Option<&Path>) -> io::Result<Self> {
        let prefix = format!("stageload-shard-{}-", index);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".json.gz");
        let file = match staging_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let handle = file.as_file().try_clone()?;

        Ok(Self {
            index,
            encoder: GzEncoder::new(Box::new(BufWriter::new(handle)), Compression::default()),
            file,
            records: 0,
            bytes: 0,
        })
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.encoder.write_all(line)?;
        self.records += 1;
        self.bytes += line.len() as u64;
        Ok(())
    }

    /// Blocking: flushes the gzip trailer and syncs the file.
    fn finish(self) -> io::Result<FinalizedShard> {
        let mut sink = self.encoder.finish()?;
        sink.flush()?;
        drop(sink);

        let file = self.file.as_file();
        file.sync_all()?;
        let compressed_bytes = file.metadata()?.len();

        Ok(FinalizedShard {
            index: self.index,
            records: self.records,
            uncompressed_bytes: self.bytes,
            compressed_bytes,
            file: self.file,
        })
    }
}

/// A shard whose gzip stream is complete and whose bytes sit in a local file.
///
/// The local file is removed when this value is dropped.
#[derive(Debug)]
pub struct FinalizedShard {
    pub index: usize,
    pub records: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    file: NamedTempFile,
}

impl FinalizedShard {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Compressed shard contents
    pub async fn read_bytes(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.file.path()).await
    }
}

/// Owns the shards and the round-robin cursor.
///
/// Takes `&mut self` for every write: a single producer by construction.
pub struct ShardedBufferWriter {
    shards: Vec<Shard>,
    cursor: usize,
    written: u64,
}

impl std::fmt::Debug for ShardedBufferWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedBufferWriter")
            .field("shards", &self.shards.len())
            .field("cursor", &self.cursor)
            .field("written", &self.written)
            .finish()
    }
}

impl ShardedBufferWriter {
    /// Create `count` shards, each backed by a temporary file in
    /// `staging_dir` (or the system temp dir).
    pub fn new(count: usize, staging_dir: Option<&Path>) -> io::Result<Self> {
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shard count must be at least 1",
            ));
        }

        let shards = (0..count)
            .map(|index| Shard::create(index, staging_dir))
            .collect::<io::Result<Vec<_>>>()?;

        debug!(
            shards = count,
            staging_dir = ?staging_dir.map(PathBuf::from),
            "Allocated shard buffers"
        );

        Ok(Self {
            shards,
            cursor: 0,
            written: 0,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn records_written(&self) -> u64 {
        self.written
    }

    pub fn has_records(&self) -> bool {
        self.written > 0
    }

    /// Point shard `index` at `sink` instead of its temp file.
    #[cfg(test)]
    pub(crate) fn replace_sink(&mut self, index: usize, sink: ShardSink) {
        self.shards[index].encoder = GzEncoder::new(sink, Compression::default());
    }

    /// Records routed to each shard so far, by shard index
    pub fn counts(&self) -> Vec<u64> {
        self.shards.iter().map(|s| s.records).collect()
    }

    /// Advance the cursor and return the shard it now points at.
    fn select(&mut self) -> usize {
        self.cursor = (self.cursor + 1) % self.shards.len();
        self.cursor
    }

    /// Write one already-serialized line into the next shard.
    ///
    /// Returns the index of the shard that received it.
    pub fn route_line(&mut self, line: &[u8]) -> io::Result<usize> {
        let index = self.select();
        self.shards[index].write_line(line)?;
        self.written += 1;
        Ok(index)
    }

    /// Serialize `record` as one NDJSON line and route it.
    pub fn route(&mut self, record: &Record) -> Result<usize, PipelineError> {
        let line = to_ndjson_line(record)?;
        self.route_line(line.as_bytes()).map_err(PipelineError::Shard)
    }

    /// End input on every shard and wait for all of them.
    ///
    /// Shards are finished concurrently on the blocking pool; the first
    /// failure fails the whole call.
    pub async fn finalize_all(self) -> io::Result<Vec<FinalizedShard>> {
        let tasks = self.shards.into_iter().map(|shard| async move {
            tokio::task::spawn_blocking(move || shard.finish())
                .await
                .map_err(io::Error::other)?
        });

        let finalized = try_join_all(tasks).await?;

        info!(
            shards = finalized.len(),
            records = self.written,
            compressed_bytes = finalized.iter().map(|s| s.compressed_bytes).sum::<u64>(),
            "Finalized shard buffers"
        );

        Ok(finalized)
    }
}

/// Sink whose every write fails, like a full disk
#[cfg(test)]
pub(crate) struct BrokenSink;

#[cfg(test)]
impl Write for BrokenSink {
    fn write(&mut self, _: &[u8]) -> io::Result<usize> {
        Err(io::Error::other("no space left on device"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::other("no space left on device"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use proptest::prelude::*;
    use std::io::Read;

    fn record(n: usize) -> Record {
        let mut record = Record::new();
        record.insert("n".to_string(), serde_json::json!(n));
        record
    }

    fn gunzip(bytes: &[u8]) -> String {
        let mut out = String::new();
        GzDecoder::new(bytes).read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_zero_shards_rejected() {
        let err = ShardedBufferWriter::new(0, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_first_record_goes_to_index_one() {
        let mut writer = ShardedBufferWriter::new(4, None).unwrap();
        assert_eq!(writer.route(&record(0)).unwrap(), 1);
        assert_eq!(writer.route(&record(1)).unwrap(), 2);
        assert_eq!(writer.route(&record(2)).unwrap(), 3);
        assert_eq!(writer.route(&record(3)).unwrap(), 0);
    }

    #[test]
    fn test_single_shard_takes_everything() {
        let mut writer = ShardedBufferWriter::new(1, None).unwrap();
        for n in 0..5 {
            assert_eq!(writer.route(&record(n)).unwrap(), 0);
        }
        assert_eq!(writer.counts(), vec![5]);
    }

    #[test]
    fn test_seven_records_over_three_shards() {
        let mut writer = ShardedBufferWriter::new(3, None).unwrap();
        let indices: Vec<usize> = (0..7).map(|n| writer.route(&record(n)).unwrap()).collect();

        assert_eq!(indices, vec![1, 2, 0, 1, 2, 0, 1]);
        // Shard 1 is filled first, so it ends up with the extra record.
        assert_eq!(writer.counts(), vec![2, 3, 2]);
        assert_eq!(writer.records_written(), 7);
    }

    #[tokio::test]
    async fn test_finalize_produces_gzip_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShardedBufferWriter::new(2, Some(dir.path())).unwrap();
        for n in 0..5 {
            writer.route(&record(n)).unwrap();
        }

        let shards = writer.finalize_all().await.unwrap();
        assert_eq!(shards.len(), 2);
        assert!(shards.iter().all(|s| s.path().starts_with(dir.path())));

        // Shard 1 received records 0, 2, 4; shard 0 received 1, 3.
        let shard1 = gunzip(&shards[1].read_bytes().await.unwrap());
        assert_eq!(shard1, "{\"n\":0}\n{\"n\":2}\n{\"n\":4}\n");
        let shard0 = gunzip(&shards[0].read_bytes().await.unwrap());
        assert_eq!(shard0, "{\"n\":1}\n{\"n\":3}\n");

        assert_eq!(shards[1].records, 3);
        assert_eq!(shards[1].uncompressed_bytes, shard1.len() as u64);
        assert!(shards[1].compressed_bytes > 0);
    }

    #[tokio::test]
    async fn test_finalize_without_records_yields_empty_streams() {
        let writer = ShardedBufferWriter::new(3, None).unwrap();
        assert!(!writer.has_records());

        let shards = writer.finalize_all().await.unwrap();
        assert_eq!(shards.len(), 3);
        for shard in &shards {
            assert_eq!(shard.records, 0);
            assert_eq!(gunzip(&shard.read_bytes().await.unwrap()), "");
        }
    }

    #[tokio::test]
    async fn test_local_files_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShardedBufferWriter::new(2, Some(dir.path())).unwrap();
        writer.route(&record(1)).unwrap();

        let shards = writer.finalize_all().await.unwrap();
        let paths: Vec<PathBuf> = shards.iter().map(|s| s.path().to_path_buf()).collect();
        assert!(paths.iter().all(|p| p.exists()));

        drop(shards);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_route_surfaces_sink_errors() {
        let mut writer = ShardedBufferWriter::new(2, None).unwrap();
        writer.replace_sink(1, Box::new(BrokenSink));

        let err = writer.route(&record(0)).unwrap_err();
        assert!(matches!(err, PipelineError::Shard(ref e) if e.to_string().contains("no space")));
        assert_eq!(writer.records_written(), 0);
        assert_eq!(writer.counts(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_finalize_fails_when_any_shard_fails() {
        let mut writer = ShardedBufferWriter::new(3, None).unwrap();
        writer.route(&record(0)).unwrap();
        writer.replace_sink(2, Box::new(BrokenSink));

        let err = writer.finalize_all().await.unwrap_err();
        assert!(err.to_string().contains("no space left on device"));
    }

    proptest! {
        #[test]
        fn every_record_lands_in_exactly_one_shard(shards in 1usize..9, records in 0usize..64) {
            let mut writer = ShardedBufferWriter::new(shards, None).unwrap();
            for n in 0..records {
                let index = writer.route_line(b"{}\n").unwrap();
                prop_assert_eq!(index, (n + 1) % shards);
            }

            let counts = writer.counts();
            prop_assert_eq!(counts.iter().sum::<u64>(), records as u64);
            let max = counts.iter().max().copied().unwrap_or(0);
            let min = counts.iter().min().copied().unwrap_or(0);
            prop_assert!(max - min <= 1);
        }
    }
}
