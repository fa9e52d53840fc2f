use chrono::{TimeZone, Utc};
use crfs::config::{DedupMode, IndexBackend};
use crfs::{
    read, BlockList, BlockNum, Error, FileSource, ImageBuilder, Location, MemorySource, Summary,
};
use parking_lot::Mutex;
use repr::superblock::Flags;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::sync::Arc;

fn logger() -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().unwrap()
}

fn builder() -> ImageBuilder {
    let mut builder = ImageBuilder::new();
    builder.threads = 3;
    builder
        .set_logger(logger())
        .set_modification_time(Utc.timestamp_opt(1_600_000_000, 0).unwrap());
    builder
}

/// A scheduled source and what should come back out
struct Input {
    name: &'static str,
    class: u32,
    block_size: u32,
    data: Vec<u8>,
}

impl Input {
    fn new(name: &'static str, block_size: u32, data: Vec<u8>) -> Self {
        Self {
            name,
            class: 0,
            block_size,
            data,
        }
    }
}

struct Built {
    summary: Summary,
    bytes: Vec<u8>,
    lists: Vec<BlockList>,
}

fn try_build(builder: ImageBuilder, inputs: &[Input]) -> crfs::Result<Built> {
    let out = Arc::new(Mutex::new(Vec::<u8>::new()));
    let mut image = builder.build(Box::new(Arc::clone(&out)))?;
    let mut lists = Vec::new();
    for input in inputs {
        let source = MemorySource::new(input.name, input.data.clone());
        lists.push(image.schedule(source, input.class, input.block_size)?);
    }
    let summary = image.flush()?;
    let bytes = out.lock().clone();
    Ok(Built {
        summary,
        bytes,
        lists,
    })
}

fn build(builder: ImageBuilder, inputs: &[Input]) -> Built {
    try_build(builder, inputs).unwrap()
}

fn open(built: &Built) -> read::Image<Vec<u8>> {
    read::Image::with_logger(built.bytes.clone(), logger()).unwrap()
}

fn check_round_trip(built: &Built, inputs: &[Input]) {
    let mut image = open(built);
    for (input, list) in inputs.iter().zip(&built.lists) {
        let data = image
            .read_list(&list.blocks(), input.data.len() as u64, input.block_size)
            .unwrap();
        assert!(data == input.data, "{} did not survive the round trip", input.name);
    }
}

/// Deterministic pseudo random bytes
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

fn text(len: usize) -> Vec<u8> {
    b"the quick brown fox jumps over the lazy dog. "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// Compressible, but without short repeats
fn lines(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut i = 0;
    while out.len() < len {
        out.extend_from_slice(format!("line {} of some test input\n", i).as_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

#[test]
fn overlap_and_reuse_scenario() {
    let mut builder = builder();
    builder.block_size = 4;
    builder.container_size = 16;
    builder.min_free_space = 0;
    let inputs = [Input::new("a", 4, b"abcdcdefabcd".to_vec())];
    let built = build(builder, &inputs);

    assert_eq!(
        built.lists[0].blocks(),
        vec![BlockNum(0), BlockNum(1), BlockNum(0)]
    );
    assert_eq!(built.summary.unique_blocks, 2);
    assert_eq!(built.summary.containers, 1);
    assert_eq!(built.summary.raw_bytes, 6);
    assert_eq!(built.summary.reused_blocks, 1);

    let mut image = open(&built);
    assert_eq!(image.block_location(BlockNum(0)), Some(Location::new(0, 0)));
    assert_eq!(image.block_location(BlockNum(1)), Some(Location::new(0, 2)));
    assert_eq!(&image.container_data(0).unwrap()[..], b"abcdef");
    check_round_trip(&built, &inputs);
}

fn mixed_inputs() -> Vec<Input> {
    let random = noise(1, 200_000);
    // The same data again, shifted so it does not line up with block boundaries
    let mut shifted = random[1_001..150_000].to_vec();
    shifted.extend_from_slice(&text(3_000));
    let mut zeros_and_text = vec![0; 40_000];
    zeros_and_text.extend_from_slice(&text(70_000));
    vec![
        Input::new("random", 4096, random),
        Input::new("shifted", 4096, shifted),
        Input::new("text", 1024, zeros_and_text),
        Input::new("small", 4096, b"tiny".to_vec()),
        Input::new("empty", 4096, Vec::new()),
    ]
}

fn small_containers() -> ImageBuilder {
    let mut builder = builder();
    builder.container_size = 64 * 1024;
    builder.block_size = 4096;
    builder.autoindex_period = 16;
    builder
}

#[test]
fn random_and_repetitive_data_round_trips() {
    let inputs = mixed_inputs();
    let built = build(small_containers(), &inputs);
    check_round_trip(&built, &inputs);

    let input_bytes: u64 = inputs.iter().map(|i| i.data.len() as u64).sum();
    assert!(built.summary.raw_bytes < input_bytes);
    assert!(built.summary.compressed_bytes < built.summary.raw_bytes);
    assert!(built.lists[4].is_empty());
    assert_eq!(built.lists[3].len(), 1);
}

#[test]
fn containers_stay_under_the_cap() {
    let mut builder = builder();
    builder.container_size = 1000;
    builder.block_size = 100;
    builder.min_free_space = 10;
    let inputs = [
        Input::new("a", 100, noise(2, 10_000)),
        Input::new("b", 64, noise(3, 5_000)),
    ];
    let built = build(builder, &inputs);
    check_round_trip(&built, &inputs);

    let mut image = open(&built);
    assert!(image.container_count() > 10);
    for id in 0..image.container_count() as u32 {
        assert!(image.container_data(id).unwrap().len() <= 1000);
    }
}

#[test]
fn output_is_deterministic() {
    let inputs = mixed_inputs();
    let first = build(small_containers(), &inputs);
    let second = build(small_containers(), &inputs);
    assert!(first.bytes == second.bytes);
    assert_eq!(first.summary, second.summary);
}

#[test]
fn identical_sources_share_blocks() {
    let data = noise(4, 50_000);
    let once = build(small_containers(), &[Input::new("a", 4096, data.clone())]);
    let inputs = [
        Input::new("a", 4096, data.clone()),
        Input::new("b", 4096, data),
    ];
    let twice = build(small_containers(), &inputs);

    assert_eq!(twice.lists[0].blocks(), twice.lists[1].blocks());
    assert_eq!(once.summary.raw_bytes, twice.summary.raw_bytes);
    assert_eq!(once.summary.unique_blocks, twice.summary.unique_blocks);
    assert_eq!(twice.summary.reused_blocks, once.summary.unique_blocks);
    check_round_trip(&twice, &inputs);
}

#[test]
fn sources_are_placed_by_class_then_name() {
    let mut inputs = vec![
        Input::new("b", 4, b"bbbb".to_vec()),
        Input::new("a", 4, b"aaaa".to_vec()),
        Input::new("c", 4, b"cccc".to_vec()),
    ];
    inputs[2].class = 0;
    inputs[0].class = 1;
    inputs[1].class = 1;
    let mut builder = builder();
    builder.dedup = DedupMode::None;
    let built = build(builder, &inputs);
    assert_eq!(built.lists[2].blocks(), vec![BlockNum(0)]);
    assert_eq!(built.lists[1].blocks(), vec![BlockNum(1)]);
    assert_eq!(built.lists[0].blocks(), vec![BlockNum(2)]);
}

#[test]
fn overlaps_respect_granularity() {
    let inputs = [
        Input::new("a", 8, b"abcdefgh".to_vec()),
        Input::new("b", 8, b"fghXYZ12".to_vec()),
    ];
    let location_of_b = |granularity: u32| {
        let mut builder = builder();
        builder.overlap_granularity = granularity;
        let built = build(builder, &inputs);
        check_round_trip(&built, &inputs);
        let block = built.lists[1].blocks()[0];
        open(&built).block_location(block).unwrap()
    };
    assert_eq!(location_of_b(1), Location::new(0, 5));
    assert_eq!(location_of_b(2), Location::new(0, 8));
    assert_eq!(location_of_b(0), Location::new(0, 8));
}

#[test]
fn dedup_modes() {
    let mut data = Vec::new();
    for _ in 0..3 {
        data.extend_from_slice(&[0; 16]);
        data.extend_from_slice(b"hello world, hi!");
    }
    let inputs = [Input::new("a", 16, data)];
    let unique_blocks = |dedup: DedupMode| {
        let mut builder = builder();
        builder.dedup = dedup;
        let built = build(builder, &inputs);
        check_round_trip(&built, &inputs);
        assert_eq!(built.summary.blocks, 6);
        built.summary.unique_blocks
    };
    assert_eq!(unique_blocks(DedupMode::None), 6);
    assert_eq!(unique_blocks(DedupMode::BlanksOnly), 4);
    assert_eq!(unique_blocks(DedupMode::All), 2);
    assert_eq!(unique_blocks(DedupMode::AllWithPrepass), 2);
}

#[test]
fn every_index_backend_finds_duplicates() {
    let inputs = mixed_inputs();
    let indexed_builder = || {
        let mut builder = small_containers();
        builder.autoindex_period = 1024;
        builder
    };
    let reference = build(indexed_builder(), &inputs);
    for &backend in &[IndexBackend::Compressed, IndexBackend::DiskFile] {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = indexed_builder();
        builder.index_backend = backend;
        builder.staging_dir = Some(dir.path().to_owned());
        let built = build(builder, &inputs);
        check_round_trip(&built, &inputs);
        assert_eq!(built.summary.unique_blocks, reference.summary.unique_blocks);
        assert!(built.bytes == reference.bytes, "{:?} changed the image", backend);
    }
}

#[test]
fn sparse_containers() {
    let mut builder = small_containers();
    builder.sparse_containers = true;
    // Every container has to compress to less than its capacity
    let inputs = [
        Input::new("lines", 4096, lines(150_000)),
        Input::new("noise", 4096, noise(6, 3_000)),
    ];
    let built = build(builder, &inputs);
    check_round_trip(&built, &inputs);

    let image = open(&built);
    assert!(image.flags().contains(Flags::SPARSE_CONTAINERS));
    let superblock = image.superblock();
    let stride = 4 + 64 * 1024;
    assert_eq!(
        superblock.block_table_start.get(),
        superblock.container_table_start.get()
            + u64::from(superblock.container_count.get()) * stride
    );
}

#[test]
fn sparse_containers_must_compress() {
    let mut builder = builder();
    builder.container_size = 64;
    builder.block_size = 64;
    builder.min_free_space = 0;
    builder.sparse_containers = true;
    let inputs = [Input::new("a", 64, noise(5, 64))];
    let err = try_build(builder, &inputs).err().unwrap();
    assert!(matches!(err, Error::CompressedTooLarge { container: 0, .. }), "{}", err);
}

#[test]
fn packed_and_unpacked_locators() {
    let inputs = mixed_inputs();
    let packed = build(small_containers(), &inputs);
    let mut builder = small_containers();
    builder.pack_locators = false;
    let unpacked = build(builder, &inputs);

    assert!(packed.summary.packed_locators);
    assert!(!unpacked.summary.packed_locators);
    assert!(open(&packed).flags().contains(Flags::PACKED_LOCATORS));
    assert!(!open(&unpacked).flags().contains(Flags::PACKED_LOCATORS));
    check_round_trip(&packed, &inputs);
    check_round_trip(&unpacked, &inputs);

    let (mut a, mut b) = (open(&packed), open(&unpacked));
    for block in 0..a.block_count() as u32 {
        assert_eq!(a.block_location(BlockNum(block)), b.block_location(BlockNum(block)));
    }
    assert_eq!(a.container_data(0).unwrap(), b.container_data(0).unwrap());
}

#[test]
fn resume_checkpoint_is_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("resume");
    let inputs = mixed_inputs();
    let prepass = || {
        let mut builder = small_containers();
        builder.dedup = DedupMode::AllWithPrepass;
        builder.resume_checkpoint = Some(checkpoint.clone());
        builder
    };

    let first = build(prepass(), &inputs);
    assert!(checkpoint.exists());
    let written = std::fs::read(&checkpoint).unwrap();
    assert_eq!(&written[..8], b"CRFSRSM\x01");

    let second = build(prepass(), &inputs);
    assert!(first.bytes == second.bytes);
    check_round_trip(&second, &inputs);
}

#[test]
fn out_of_range_checkpoint_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("resume");
    let mut raw = b"CRFSRSM\x01".to_vec();
    raw.extend_from_slice(&3u64.to_le_bytes());
    raw.extend_from_slice(&1u64.to_le_bytes());
    raw.extend_from_slice(&100u64.to_le_bytes());
    raw.extend_from_slice(&0u64.to_le_bytes());
    std::fs::write(&checkpoint, raw).unwrap();

    let mut builder = builder();
    builder.dedup = DedupMode::AllWithPrepass;
    builder.resume_checkpoint = Some(checkpoint);
    let inputs = [Input::new("a", 4, b"aaaabbbbcccc".to_vec())];
    let err = try_build(builder, &inputs).err().unwrap();
    assert!(
        matches!(err, Error::ResumeOutOfRange { position: 100, blocks: 3 }),
        "{}",
        err
    );
}

#[test]
fn files_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("input");
    let data = text(100_000);
    std::fs::write(&input_path, &data).unwrap();

    let image_path = dir.path().join("image.crfs");
    let mut builder = builder();
    builder.compressor = crfs::compression::Kind::Gzip;
    builder.compression_level = Some(6);
    let mut image = builder.build_path(&image_path).unwrap();
    let list = image
        .schedule_default(FileSource::new(&input_path).unwrap(), 0)
        .unwrap();
    let summary = image.flush().unwrap();
    assert_eq!(summary.image_bytes, std::fs::metadata(&image_path).unwrap().len());

    let mut image = read::Image::open_with_logger(&image_path, logger()).unwrap();
    let read = image
        .read_list(&list.blocks(), data.len() as u64, repr::BLOCK_SIZE_DEFAULT)
        .unwrap();
    assert!(read == data);
}
