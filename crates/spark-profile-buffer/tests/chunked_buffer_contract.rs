//! `chunked_buffer_contract` 集成测试：带本地上限管理器的分块缓冲完整生命周期。
//!
//! # 测试目标（Why）
//! - 会话外的每个操作都必须干净地失败，且不改变任何计数；
//! - 会话内的写入、读取、分离、淘汰、清空与并发写入共同维持 `[range_start, range_end)` 的存活语义；
//! - 回到会话外后，索引从原 `range_end` 继续，计数器归零。

use std::sync::Arc;

use spark_profile_buffer::{
    BlockIndex, BufferIndex, ChunkManager, ChunkedBuffer, LocalLimitChunkManager, State, WithMutex,
    leb128,
};

const BUFFER_MAX_SIZE: usize = 1024;
const CHUNK_MIN_SIZE: usize = 128;

fn state(
    range_start: BufferIndex,
    range_end: BufferIndex,
    pushed_block_count: u64,
    cleared_block_count: u64,
    failed_put_bytes: u64,
) -> State {
    State {
        range_start,
        range_end,
        pushed_block_count,
        cleared_block_count,
        failed_put_bytes,
    }
}

/// 会话外的全部写入与读取入口都失败，且状态保持 `expected`。
fn assert_out_of_session(buffer: &ChunkedBuffer, expected: State) {
    let result = buffer.reserve_and_put(
        || panic!("会话外不应计算负载长度"),
        |writer| if writer.is_some() { 2 } else { 3 },
    );
    assert_eq!(result, 3);
    assert_eq!(buffer.state(), expected);

    let result = buffer.put(1, |writer| if writer.is_some() { 1 } else { 2 });
    assert_eq!(result, 2);
    assert_eq!(buffer.state(), expected);

    assert!(buffer.put_from(&[1]).is_null());
    assert!(buffer.put_objects((123i32, 7i32, "hello")).is_null());
    assert!(buffer.put_object(&123i32).is_null());
    assert_eq!(buffer.state(), expected);

    assert!(buffer.get_all_chunks().is_empty(), "会话外没有分块");
    assert_eq!(buffer.buffer_length(), None);

    let mut ran = false;
    let result = buffer.read(|reader| {
        ran = true;
        assert!(reader.is_none());
        3
    });
    assert!(ran);
    assert_eq!(result, 3);

    buffer.read_each(|_| panic!("会话外没有可读块"));
    let result = buffer.read_at(BlockIndex::NULL, |entry| {
        assert!(entry.is_none());
        4
    });
    assert_eq!(result, 4);
    assert_eq!(buffer.state(), expected);
}

#[test]
fn full_session_lifecycle() {
    let buffer: ChunkedBuffer = ChunkedBuffer::new();
    assert_out_of_session(&buffer, state(1, 1, 0, 0, 0));

    let manager = Arc::new(LocalLimitChunkManager::new(BUFFER_MAX_SIZE, CHUNK_MIN_SIZE));
    buffer.set_chunk_manager(manager.clone());
    assert_eq!(buffer.state(), state(1, 1, 0, 0, 0));

    // 让管理器满足挂接时发出的后继分块请求。
    manager.fulfill_chunk_requests();
    assert_eq!(manager.max_total_size(), BUFFER_MAX_SIZE);
    assert_eq!(buffer.buffer_length(), Some(BUFFER_MAX_SIZE));
    assert_eq!(buffer.state(), state(1, 1, 0, 0, 0));

    // 以最基本的 reserve_and_put 写入一个 i32。
    const TEST: i32 = 123;
    let test_bytes = core::mem::size_of::<i32>();
    let mut written = BlockIndex::NULL;
    let success = buffer.reserve_and_put(
        || test_bytes,
        |writer| {
            let Some(writer) = writer else {
                return false;
            };
            written = writer.current_block_index();
            assert_eq!(writer.remaining_bytes(), test_bytes);
            writer.write_object(&TEST);
            assert_eq!(writer.remaining_bytes(), 0);
            true
        },
    );
    assert!(success);
    assert_eq!(written.to_index(), 1);
    let end_after_int = 1 + 1 + test_bytes as BufferIndex;
    assert_eq!(buffer.state(), state(1, end_after_int, 1, 0, 0));

    let result = buffer.read(|reader| {
        let reader = reader.expect("会话内总有读取视图");
        assert_eq!(reader.range_start(), 1);
        assert_eq!(reader.range_end(), end_after_int);
        let first = reader.iter().next().expect("一个块");
        assert_eq!(first.current_block_index().to_index(), 1);
        assert_eq!(
            reader.at(BlockIndex::NULL).map(|e| e.current_block_index()),
            Some(written),
            "空索引钳到开头"
        );
        assert_eq!(reader.at(written).map(|e| e.current_block_index()), Some(written));
        assert!(
            reader.at(BlockIndex::from_index(end_after_int)).is_none(),
            "越过末尾即结束"
        );

        let mut read = 0;
        reader.for_each(|entry| {
            read += 1;
            assert_eq!(entry.remaining_bytes(), test_bytes);
            assert_eq!(entry.read_object::<i32>().expect("i32"), TEST);
            assert_eq!(entry.remaining_bytes(), 0);
        });
        assert_eq!(read, 1);

        let mut read = 0;
        for mut entry in reader {
            read += 1;
            assert_eq!(entry.read_object::<i32>().expect("i32"), TEST);
        }
        assert_eq!(read, 1);
        5
    });
    assert_eq!(result, 5);

    let mut read = 0;
    buffer.read_each(|entry| {
        read += 1;
        assert_eq!(entry.read_object::<i32>().expect("i32"), TEST);
    });
    assert_eq!(read, 1);

    let mut indexed = BlockIndex::NULL;
    buffer.read_each_indexed(|entry, block_index| {
        assert!(!block_index.is_null());
        assert!(indexed.is_null(), "只有一个块");
        indexed = block_index;
        assert_eq!(entry.read_object::<i32>().expect("i32"), TEST);
    });
    assert_eq!(indexed, written);

    let result = buffer.read_at(written, |entry| {
        let entry = entry.expect("块仍然存活");
        assert_eq!(entry.current_block_index(), written);
        assert!(entry.next_block_index().is_null(), "最后一个块没有后继");
        assert_eq!(entry.read_object::<i32>().expect("i32"), TEST);
        6
    });
    assert_eq!(result, 6);

    assert!(!buffer.is_index_in_current_chunk(0));
    assert!(buffer.is_index_in_current_chunk(written.to_index()));
    assert!(buffer.is_index_in_current_chunk(end_after_int - 1));
    assert!(!buffer.is_index_in_current_chunk(end_after_int));
    assert_eq!(buffer.state(), state(1, end_after_int, 1, 0, 0), "读取不改变状态");

    // 分离全部分块：当前分块与已就绪的后继分块。
    let chunks = buffer.get_all_chunks();
    assert_eq!(chunks.len(), 2);
    let first = chunks.first().expect("两个分块");
    let chunk_actual_size = first.buffer_bytes();
    assert!(chunk_actual_size >= CHUNK_MIN_SIZE);
    assert_eq!(first.range_start(), 1);
    assert_eq!(first.offset_first_block(), 0);
    assert_eq!(first.offset_past_last_block(), 1 + test_bytes);
    assert!(chunks.iter().all(|chunk| chunk.is_done()));

    let after_detach = 1 + chunk_actual_size as BufferIndex;
    assert_eq!(buffer.state(), state(after_detach, after_detach, 1, 0, 0));
    buffer.read_each(|_| panic!("分离后缓冲为空"));
    buffer.read_each_indexed(|_, _| panic!("分离后缓冲为空"));
    let result = buffer.read_at(BlockIndex::NULL, |entry| {
        assert!(entry.is_none());
        7
    });
    assert_eq!(result, 7);

    let mut read = 0;
    ChunkedBuffer::<WithMutex>::read_each_in_chunks(&chunks, |entry| {
        read += 1;
        assert_eq!(entry.current_block_index(), written);
        assert_eq!(entry.read_object::<i32>().expect("i32"), TEST);
    });
    assert_eq!(read, 1);
    assert_eq!(buffer.state(), state(after_detach, after_detach, 1, 0, 0));

    // 大量写入触发分块淘汰。
    let lots = (2 * BUFFER_MAX_SIZE / (1 + test_bytes)) as u64;
    let mut first_index = BlockIndex::NULL;
    let mut last_index = BlockIndex::NULL;
    for i in 1..lots {
        let block_index = buffer.put_from(&i.to_le_bytes());
        assert!(!block_index.is_null());
        assert!(block_index > first_index);
        if first_index.is_null() {
            first_index = block_index;
        }
        assert!(block_index > last_index);
        last_index = block_index;
    }

    let after_puts = buffer.state();
    assert!(after_puts.range_start > after_detach);
    assert!(after_puts.range_end > after_puts.range_start);
    assert!(after_puts.pushed_block_count > 0);
    assert!(after_puts.cleared_block_count > 0, "预算滚动后有块被淘汰");
    assert_eq!(after_puts.failed_put_bytes, 0);
    assert!(!buffer.is_index_in_current_chunk(0));
    assert!(!buffer.is_index_in_current_chunk(written.to_index()));
    assert!(!buffer.is_index_in_current_chunk(first_index.to_index()));

    let mut read = 0u64;
    let mut previous = 0u64;
    buffer.read_each_indexed(|entry, block_index| {
        read += 1;
        assert!(block_index > first_index, "最早的块已被淘汰");
        assert!(block_index <= last_index);
        assert_eq!(entry.remaining_bytes(), 8);
        let value = entry.read_object::<u64>().expect("u64");
        if previous != 0 {
            assert_eq!(value, previous + 1, "存活块首尾相接");
        }
        previous = value;
    });
    assert!(read > 0);
    assert!(read < lots);

    // 从已淘汰的首个索引读取会钳到最早的存活块，再沿后继索引走完全部块。
    let mut next = BlockIndex::NULL;
    let mut value = buffer.read_at(first_index, |entry| {
        let entry = entry.expect("钳到首个存活块");
        assert!(entry.current_block_index() > first_index);
        next = entry.next_block_index();
        assert!(next > first_index && next < last_index);
        entry.read_object::<u64>().expect("u64")
    });
    let mut walked = 1;
    while !next.is_null() {
        let current = next;
        value = buffer.read_at(current, |entry| {
            let entry = entry.expect("后继块存活");
            assert_eq!(entry.current_block_index(), current);
            next = entry.next_block_index();
            if next.is_null() {
                assert_eq!(current, last_index, "只有最后一个块没有后继");
            } else {
                assert!(next > current && next <= last_index);
            }
            let next_value = entry.read_object::<u64>().expect("u64");
            assert_eq!(next_value, value + 1);
            next_value
        });
        walked += 1;
    }
    assert!(walked > 1);
    assert_eq!(buffer.state(), after_puts, "读取不改变状态");

    buffer.clear();
    let after_clear = buffer.state();
    assert!(after_clear.range_start > after_puts.range_start);
    assert_eq!(
        after_clear,
        state(after_clear.range_start, after_clear.range_start, 0, 0, 0)
    );
    assert!(!buffer.is_index_in_current_chunk(0));
    assert!(!buffer.is_index_in_current_chunk(written.to_index()));
    assert!(!buffer.is_index_in_current_chunk(after_clear.range_end - 1));
    assert!(!buffer.is_index_in_current_chunk(after_clear.range_end));

    // 多线程并发写入。
    const THREAD_COUNT: i32 = 32;
    const PUSH_COUNT: i32 = 1024;
    std::thread::scope(|scope| {
        for thread_no in 0..THREAD_COUNT {
            let buffer = &buffer;
            scope.spawn(move || {
                let entry_bytes = thread_no.max(core::mem::size_of::<i32>() as i32) as usize;
                for push in 0..PUSH_COUNT {
                    let success = buffer.put(entry_bytes, |writer| {
                        let Some(writer) = writer else {
                            return false;
                        };
                        writer.write_object(&(thread_no * 1_000_000 + push));
                        while writer.remaining_bytes() > 0 {
                            writer.write_object(&b'_');
                        }
                        true
                    });
                    assert!(success, "预算滚动下写入不应失败");
                }
            });
        }
    });

    let after_mt = buffer.state();
    assert!(after_mt.range_start > after_clear.range_start);
    assert!(after_mt.range_end > after_mt.range_start);
    assert!(after_mt.pushed_block_count > 0);
    assert!(after_mt.cleared_block_count > 0);
    assert_eq!(after_mt.failed_put_bytes, 0);

    buffer.reset_chunk_manager();
    let after_reset = state(after_mt.range_end, after_mt.range_end, 0, 0, 0);
    assert_eq!(buffer.state(), after_reset);
    assert_out_of_session(&buffer, after_reset);
}

#[test]
fn a_new_session_continues_after_the_previous_range() {
    let manager = Arc::new(LocalLimitChunkManager::new(BUFFER_MAX_SIZE, CHUNK_MIN_SIZE));
    let buffer: ChunkedBuffer = ChunkedBuffer::with_chunk_manager(manager);
    let first = buffer.put_from(b"first");
    assert_eq!(first.to_index(), 1);
    let end = buffer.state().range_end;

    let replacement = Arc::new(LocalLimitChunkManager::new(BUFFER_MAX_SIZE, CHUNK_MIN_SIZE));
    buffer.set_chunk_manager(replacement);
    let restarted = buffer.state();
    assert!(restarted.range_start >= end, "新会话的索引不回退");
    assert_eq!(restarted.range_start, restarted.range_end);
    assert_eq!(restarted.pushed_block_count, 0);
    buffer.read_each(|_| panic!("旧会话的块不可见"));

    let second = buffer.put_from(b"second");
    assert!(second > first);
    buffer.read_at(second, |entry| {
        let entry = entry.expect("新块存活");
        assert_eq!(entry.read_remaining(), b"second");
    });
}

#[test]
fn oversized_blocks_are_refused_and_counted() {
    let manager = Arc::new(LocalLimitChunkManager::new(BUFFER_MAX_SIZE, CHUNK_MIN_SIZE));
    let chunk_bytes = manager.chunk_buffer_bytes();
    let buffer: ChunkedBuffer = ChunkedBuffer::with_chunk_manager(manager);

    let payload = vec![0u8; chunk_bytes];
    assert!(buffer.put_from(&payload).is_null(), "块必须严格小于一个分块");
    let refused = buffer.state();
    assert_eq!(refused.pushed_block_count, 0);
    assert_eq!(refused.failed_put_bytes, 2 + chunk_bytes as u64);

    assert!(!buffer.put_from(b"ok").is_null(), "拒绝之后仍可写入小块");
    assert_eq!(buffer.state().failed_put_bytes, refused.failed_put_bytes);
}

#[test]
fn lengths_overflowing_the_block_size_are_refused() {
    let buffer: ChunkedBuffer = ChunkedBuffer::with_chunk_manager(Arc::new(
        LocalLimitChunkManager::new(BUFFER_MAX_SIZE, CHUNK_MIN_SIZE),
    ));
    let before = buffer.state();

    assert!(buffer.put(usize::MAX, |writer| writer.is_none()), "写入器应为空");
    let refused = buffer.state();
    assert_eq!(refused.range_end, before.range_end);
    assert_eq!(refused.pushed_block_count, 0);
    let prefix_bytes = leb128::encoded_size(usize::MAX as u64) as u64;
    assert_eq!(
        refused.failed_put_bytes,
        (usize::MAX as u64).saturating_add(prefix_bytes)
    );

    assert!(buffer.reserve_and_put(|| usize::MAX - 1, |writer| writer.is_none()));
    assert_eq!(buffer.state().failed_put_bytes, u64::MAX, "失败字节数饱和而不溢出");

    assert!(!buffer.put_from(b"ok").is_null(), "拒绝之后仍可写入小块");
}

#[test]
fn blocks_spanning_chunks_read_back_intact() {
    let manager = Arc::new(LocalLimitChunkManager::new(4096, 64));
    let buffer: ChunkedBuffer = ChunkedBuffer::with_chunk_manager(manager);
    let payloads: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 7 + usize::from(i % 23)]).collect();
    let indices: Vec<BlockIndex> = payloads.iter().map(|p| buffer.put_from(p)).collect();
    assert!(indices.iter().all(|index| !index.is_null()));
    assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));

    let mut read_back = Vec::new();
    buffer.read_each(|entry| read_back.push(entry.read_remaining()));
    assert_eq!(read_back, payloads);

    for (index, payload) in indices.iter().zip(&payloads) {
        buffer.read_at(*index, |entry| {
            assert_eq!(entry.expect("存活").read_remaining(), *payload);
        });
    }
}

#[test]
fn detached_chunks_are_walked_outside_every_lock() {
    let manager = Arc::new(LocalLimitChunkManager::new(4096, 64));
    let source: ChunkedBuffer = ChunkedBuffer::with_chunk_manager(manager.clone());
    let sink: ChunkedBuffer = ChunkedBuffer::with_chunk_manager(manager);
    let payloads: Vec<Vec<u8>> = (0..30u8).map(|i| vec![i; 16]).collect();
    for payload in &payloads {
        assert!(!source.put_from(payload).is_null());
    }

    let chunks = source.get_all_chunks();
    assert!(chunks.len() > 2, "内容跨越多个分块");
    // 遍历分离的分块不持有缓冲锁或管理器锁，回调中可以写入共享同一管理器的缓冲。
    ChunkedBuffer::<WithMutex>::read_each_in_chunks(&chunks, |entry| {
        let bytes = entry.read_remaining();
        assert!(!sink.put_from(&bytes).is_null());
        assert!(!source.put_from(b"x").is_null());
    });

    let mut copied = Vec::new();
    sink.read_each(|entry| copied.push(entry.read_remaining()));
    assert_eq!(copied, payloads);
    let mut markers = 0;
    source.read_each(|entry| {
        assert_eq!(entry.read_remaining(), b"x");
        markers += 1;
    });
    assert_eq!(markers, payloads.len());
}
