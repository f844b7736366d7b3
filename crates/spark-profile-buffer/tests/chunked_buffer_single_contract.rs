//! `chunked_buffer_single_contract` 集成测试：单分块、无锁模式下的填满、拒绝与清空。
//!
//! # 测试目标（Why）
//! - 单分块缓冲被写满（或一次写入放不下）之后必须持续拒绝，直到 `clear()` 收回分块；
//! - `clear()` 即使复用同一个分块也要把索引推进一个完整分块；
//! - `append_contents` 跨线程安全模式复制内容，目标缓冲得到与源相同的块与状态。

use std::sync::Arc;

use spark_profile_buffer::{
    BufferIndex, ChunkedBuffer, LocalLimitChunkManager, SingleChunkManager, State, WithoutMutex,
    leb128,
};

const CHUNK_MIN_SIZE: usize = 128;
const TEST_BLOCKS: usize = 4;

fn assert_state(
    buffer_state: State,
    range_start: BufferIndex,
    range_end: BufferIndex,
    pushed_block_count: u64,
    failed_put_bytes: u64,
) {
    assert_eq!(
        buffer_state,
        State {
            range_start,
            range_end,
            pushed_block_count,
            cleared_block_count: 0,
            failed_put_bytes,
        }
    );
}

/// 写入一个以 `fill` 填满的块，返回是否成功。
fn put_filled<S: spark_profile_buffer::ThreadSafety>(
    buffer: &ChunkedBuffer<S>,
    entry_bytes: usize,
    fill: u8,
) -> bool {
    buffer.put(entry_bytes, |writer| match writer {
        Some(writer) => {
            writer.write_bytes(&vec![fill; writer.remaining_bytes()]);
            true
        }
        None => false,
    })
}

fn read_all<S: spark_profile_buffer::ThreadSafety>(buffer: &ChunkedBuffer<S>) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    buffer.read_each(|entry| blocks.push(entry.read_remaining()));
    blocks
}

#[test]
fn single_chunk_fills_refuses_and_recovers_on_clear() {
    let single: ChunkedBuffer<WithoutMutex> =
        ChunkedBuffer::with_chunk_manager(Arc::new(SingleChunkManager::new(CHUNK_MIN_SIZE)));
    let buffer_bytes = single.buffer_length().expect("会话内");
    assert!(buffer_bytes >= CHUNK_MIN_SIZE);
    assert_state(single.state(), 1, 1, 0, 0);

    let block_bytes = buffer_bytes / TEST_BLOCKS;
    assert_eq!(leb128::encoded_size(block_bytes as u64), 1);
    let entry_bytes = block_bytes - 1;
    let span = |blocks: usize| (block_bytes * blocks) as BufferIndex;

    // 第一轮：最后一个块超出剩余空间 1 字节。
    for i in 0..TEST_BLOCKS - 1 {
        assert!(put_filled(&single, entry_bytes, b'0' + i as u8));
        assert_state(single.state(), 1, 1 + span(i + 1), i as u64 + 1, 0);
    }
    let remaining_for_last = buffer_bytes - block_bytes * (TEST_BLOCKS - 1);
    assert_eq!(leb128::encoded_size(remaining_for_last as u64), 1);
    let entry_to_fit_remaining = remaining_for_last - 1;
    assert!(!put_filled(&single, entry_to_fit_remaining + 1, b'!'));
    let failed_first = remaining_for_last as u64 + 1;
    assert_state(
        single.state(),
        1,
        1 + span(TEST_BLOCKS - 1),
        TEST_BLOCKS as u64 - 1,
        failed_first,
    );

    let expected: Vec<Vec<u8>> = (0..TEST_BLOCKS - 1)
        .map(|i| vec![b'0' + i as u8; entry_bytes])
        .collect();
    assert_eq!(read_all(&single), expected, "被拒绝前的块仍可读");

    // 插曲：复制到带锁的本地上限缓冲。
    let target: ChunkedBuffer = ChunkedBuffer::with_chunk_manager(Arc::new(
        LocalLimitChunkManager::new(1024, CHUNK_MIN_SIZE),
    ));
    assert!(read_all(&target).is_empty());
    assert_state(target.state(), 1, 1, 0, 0);
    target.append_contents(&single);
    assert_eq!(read_all(&target), expected);
    assert_state(
        target.state(),
        1,
        1 + span(TEST_BLOCKS - 1),
        TEST_BLOCKS as u64 - 1,
        0,
    );
    assert_eq!(read_all(&single), expected, "复制不改变源缓冲");

    // 放不下的写入使分块被视为写满，此后连 1 字节的块也被拒绝。
    assert!(!put_filled(&single, 1, b'x'));
    assert_state(
        single.state(),
        1,
        1 + span(TEST_BLOCKS - 1),
        TEST_BLOCKS as u64 - 1,
        failed_first + 2,
    );

    single.clear();
    let base = 1 + buffer_bytes as BufferIndex;
    assert_state(single.state(), base, base, 0, 0);
    assert!(read_all(&single).is_empty());

    // 第二轮：最后一个块恰好填满分块。
    for i in 0..TEST_BLOCKS - 1 {
        assert!(put_filled(&single, entry_bytes, b'a' + i as u8));
        assert_state(single.state(), base, base + span(i + 1), i as u64 + 1, 0);
    }
    assert!(put_filled(
        &single,
        entry_to_fit_remaining,
        b'a' + (TEST_BLOCKS - 1) as u8
    ));
    assert_state(
        single.state(),
        base,
        base + span(TEST_BLOCKS),
        TEST_BLOCKS as u64,
        0,
    );
    let blocks = read_all(&single);
    assert_eq!(blocks.len(), TEST_BLOCKS);
    for (i, block) in blocks.iter().enumerate() {
        assert!(block.iter().all(|&b| b == b'a' + i as u8));
    }

    assert!(!put_filled(&single, 1, b'x'), "唯一的分块已交还");
    assert_state(
        single.state(),
        base,
        base + span(TEST_BLOCKS),
        TEST_BLOCKS as u64,
        2,
    );

    single.clear();
    let base = 1 + 2 * buffer_bytes as BufferIndex;
    assert_state(single.state(), base, base, 0, 0);
    assert!(read_all(&single).is_empty());

    assert!(put_filled(&single, entry_bytes, b'x'), "clear 收回了已释放的分块");
    assert_state(single.state(), base, base + block_bytes as BufferIndex, 1, 0);
    assert_eq!(read_all(&single), vec![vec![b'x'; entry_bytes]]);
}

#[test]
fn dropping_the_buffer_detaches_from_a_shared_manager() {
    let manager = Arc::new(SingleChunkManager::new(CHUNK_MIN_SIZE));
    {
        let buffer: ChunkedBuffer<WithoutMutex> = ChunkedBuffer::with_chunk_manager(manager.clone());
        assert!(put_filled(&buffer, 10, b'd'));
    }
    assert_eq!(Arc::strong_count(&manager), 1, "析构后不再持有管理器");
}
