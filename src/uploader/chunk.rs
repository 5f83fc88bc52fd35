// 上传 part / 分片管理
//
// 文件按固定大小切成 part（序号从 1 开始），每个 part 初始为一个分片，
// 上传失败时分片会被拆成更小的分片。
//
// 不变式：
// - 所有 part 的字节范围恰好铺满 [0, 文件大小)
// - 任意时刻一个 part 当前分片的并集恰好等于该 part 的字节范围

use crate::api::PartEtag;
use crate::uploader::error::UploadError;
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::debug;

/// 默认 part 大小: 8MB
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// 默认初始分片大小: 8MB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// 分片大小下限: 32KB
pub const MIN_CHUNK_SIZE: u64 = 32 * 1024;

/// 文件的一个 part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    /// 序号（从 1 开始）
    pub number: u32,
    /// 在文件中的起始偏移
    pub offset: u64,
    /// 字节数
    pub size: u64,
}

impl Part {
    /// 在文件中的字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }
}

/// 一次 PUT 传输的单位
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 所属 part 序号
    pub part: u32,
    /// 相对 part 起点的偏移
    pub offset: u64,
    /// 字节数
    pub size: u64,
    /// 已累计的等待（时间单位数）
    pub delay_spent: u32,
    /// 已尝试次数
    pub attempts: u32,
}

impl Chunk {
    pub fn new(part: u32, offset: u64, size: u64) -> Self {
        Self {
            part,
            offset,
            size,
            delay_spent: 0,
            attempts: 0,
        }
    }

    /// 相对 part 起点的字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }

    /// 按 `chunk_size` 拆分为若干连续分片
    ///
    /// 新分片沿用原分片的累计等待与尝试次数；`chunk_size` 为 0 时原样返回
    pub fn split(&self, chunk_size: u64) -> Vec<Chunk> {
        if chunk_size == 0 || self.size <= chunk_size {
            return vec![self.clone()];
        }

        let mut pieces = Vec::with_capacity(self.size.div_ceil(chunk_size) as usize);
        let mut offset = self.offset;
        let end = self.offset + self.size;
        while offset < end {
            let size = chunk_size.min(end - offset);
            pieces.push(Chunk {
                offset,
                size,
                ..self.clone()
            });
            offset += size;
        }
        pieces
    }
}

/// 分片状态
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkState {
    Pending,
    Done(String),
}

#[derive(Debug, Clone)]
struct PartEntry {
    part: Part,
    /// 当前分片：相对偏移 -> (大小, 状态)
    chunks: BTreeMap<u64, (u64, ChunkState)>,
    committed: bool,
}

impl PartEntry {
    fn is_done(&self) -> bool {
        self.chunks
            .values()
            .all(|(_, state)| matches!(state, ChunkState::Done(_)))
    }
}

/// part 规划器
///
/// 由会话独占，不需要加锁
#[derive(Debug)]
pub struct PartPlanner {
    parts: Vec<PartEntry>,
    /// 文件总大小
    total_size: u64,
    /// part 大小
    part_size: u64,
}

impl PartPlanner {
    /// 创建 part 规划器
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `part_size` - part 大小（必须大于 0）
    ///
    /// 空文件会得到一个大小为 0 的 part，服务端仍然收到一次单 part 上传
    pub fn new(total_size: u64, part_size: u64) -> Self {
        let part_size = part_size.max(1);
        let count = if total_size == 0 {
            1
        } else {
            total_size.div_ceil(part_size)
        };

        let parts = (0..count)
            .map(|i| {
                let offset = i * part_size;
                let size = part_size.min(total_size - offset);
                let part = Part {
                    number: i as u32 + 1,
                    offset,
                    size,
                };
                let mut chunks = BTreeMap::new();
                chunks.insert(0, (size, ChunkState::Pending));
                PartEntry {
                    part,
                    chunks,
                    committed: false,
                }
            })
            .collect::<Vec<_>>();

        debug!(
            "创建 part 规划: 文件大小={}, part 大小={}, part 数量={}",
            total_size,
            part_size,
            parts.len()
        );

        Self {
            parts,
            total_size,
            part_size,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// part 数量
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// 所有 part
    pub fn parts(&self) -> Vec<Part> {
        self.parts.iter().map(|entry| entry.part).collect()
    }

    /// 获取 part
    pub fn part(&self, number: u32) -> Option<Part> {
        self.entry(number).map(|entry| entry.part)
    }

    /// 初始分片（每个 part 一个）
    pub fn initial_chunks(&self) -> Vec<Chunk> {
        self.parts
            .iter()
            .map(|entry| Chunk::new(entry.part.number, 0, entry.part.size))
            .collect()
    }

    /// 分片在文件中的绝对偏移
    pub fn absolute_offset(&self, chunk: &Chunk) -> Option<u64> {
        self.part(chunk.part).map(|part| part.offset + chunk.offset)
    }

    /// 用拆分后的分片替换一个待上传分片
    ///
    /// `pieces` 必须恰好覆盖 `failed` 的范围
    pub fn replace(&mut self, failed: &Chunk, pieces: &[Chunk]) -> Result<(), UploadError> {
        let mut cursor = failed.offset;
        for piece in pieces {
            if piece.part != failed.part
                || piece.offset != cursor
                || (piece.size == 0 && failed.size != 0)
            {
                return Err(UploadError::Internal(format!(
                    "拆分结果不连续: part={}, offset={}",
                    failed.part, piece.offset
                )));
            }
            cursor += piece.size;
        }
        if pieces.is_empty() || cursor != failed.offset + failed.size {
            return Err(UploadError::Internal(format!(
                "拆分结果未覆盖原分片: part={}, offset={}, size={}",
                failed.part, failed.offset, failed.size
            )));
        }

        let entry = self.entry_mut(failed.part)?;
        match entry.chunks.get(&failed.offset) {
            Some((size, ChunkState::Pending)) if *size == failed.size => {}
            _ => {
                return Err(UploadError::Internal(format!(
                    "分片不存在或已完成: part={}, offset={}",
                    failed.part, failed.offset
                )))
            }
        }

        entry.chunks.remove(&failed.offset);
        for piece in pieces {
            entry
                .chunks
                .insert(piece.offset, (piece.size, ChunkState::Pending));
        }

        debug!(
            "part {} 分片 offset={} 拆分为 {} 片",
            failed.part,
            failed.offset,
            pieces.len()
        );
        Ok(())
    }

    /// 标记分片上传成功
    ///
    /// # 返回
    /// 该 part 的所有当前分片是否都已完成
    pub fn mark_done(&mut self, chunk: &Chunk, etag: String) -> Result<bool, UploadError> {
        let entry = self.entry_mut(chunk.part)?;
        match entry.chunks.get_mut(&chunk.offset) {
            Some((size, state)) if *size == chunk.size => {
                *state = ChunkState::Done(etag);
            }
            _ => {
                return Err(UploadError::Internal(format!(
                    "分片不在当前规划中: part={}, offset={}, size={}",
                    chunk.part, chunk.offset, chunk.size
                )))
            }
        }
        Ok(entry.is_done())
    }

    /// part 的所有当前分片是否都已完成
    pub fn is_part_done(&self, number: u32) -> bool {
        self.entry(number).map(PartEntry::is_done).unwrap_or(false)
    }

    /// 标记 part 已提交（智能上传）
    pub fn mark_committed(&mut self, number: u32) -> Result<(), UploadError> {
        let entry = self.entry_mut(number)?;
        entry.committed = true;
        Ok(())
    }

    pub fn is_committed(&self, number: u32) -> bool {
        self.entry(number).map(|e| e.committed).unwrap_or(false)
    }

    /// part 当前分片的范围（相对 part 起点，按偏移排序）
    pub fn chunk_ranges(&self, number: u32) -> Vec<Range<u64>> {
        self.entry(number)
            .map(|entry| {
                entry
                    .chunks
                    .iter()
                    .map(|(offset, (size, _))| *offset..*offset + *size)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 普通模式 complete 所需的 ETag 列表（按 part 序号排序）
    ///
    /// 普通模式下每个 part 只有一个分片
    pub fn etags(&self) -> Result<Vec<PartEtag>, UploadError> {
        self.parts
            .iter()
            .map(|entry| {
                let mut states = entry.chunks.values();
                match (states.next(), states.next()) {
                    (Some((_, ChunkState::Done(etag))), None) => Ok(PartEtag {
                        part_number: entry.part.number,
                        etag: etag.clone(),
                    }),
                    _ => Err(UploadError::Internal(format!(
                        "part {} 没有唯一的已完成分片",
                        entry.part.number
                    ))),
                }
            })
            .collect()
    }

    /// 已完成分片的字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts
            .iter()
            .flat_map(|entry| entry.chunks.values())
            .filter(|(_, state)| matches!(state, ChunkState::Done(_)))
            .map(|(size, _)| *size)
            .sum()
    }

    /// 所有 part 是否完成
    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(PartEntry::is_done)
    }

    fn entry(&self, number: u32) -> Option<&PartEntry> {
        number
            .checked_sub(1)
            .and_then(|index| self.parts.get(index as usize))
    }

    fn entry_mut(&mut self, number: u32) -> Result<&mut PartEntry, UploadError> {
        number
            .checked_sub(1)
            .and_then(|index| self.parts.get_mut(index as usize))
            .ok_or_else(|| UploadError::Internal(format!("part {} 不存在", number)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_tiles(ranges: &[Range<u64>], expected: Range<u64>) {
        let mut cursor = expected.start;
        for range in ranges {
            assert_eq!(range.start, cursor, "出现空洞或重叠");
            cursor = range.end;
        }
        assert_eq!(cursor, expected.end);
    }

    #[test]
    fn test_part_layout() {
        let planner = PartPlanner::new(20 * 1024 * 1024, DEFAULT_PART_SIZE);
        let parts = planner.parts();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].number, 1);
        assert_eq!(parts[1].offset, DEFAULT_PART_SIZE);
        assert_eq!(parts[2].size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_exact_multiple() {
        let planner = PartPlanner::new(2 * DEFAULT_PART_SIZE, DEFAULT_PART_SIZE);
        assert_eq!(planner.part_count(), 2);
        assert_eq!(planner.part(2).unwrap().size, DEFAULT_PART_SIZE);
        assert!(planner.part(3).is_none());
        assert!(planner.part(0).is_none());
    }

    #[test]
    fn test_empty_file_has_one_part() {
        let planner = PartPlanner::new(0, DEFAULT_PART_SIZE);
        assert_eq!(planner.part_count(), 1);
        let chunks = planner.initial_chunks();
        assert_eq!(chunks, vec![Chunk::new(1, 0, 0)]);
    }

    #[test]
    fn test_chunk_split() {
        let chunk = Chunk::new(1, 0, 5_415_034);
        let pieces = chunk.split(4_194_304);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].size, 4_194_304);
        assert_eq!(pieces[1].offset, 4_194_304);
        assert_eq!(pieces[1].size, 1_220_730);

        // 不需要拆分
        assert_eq!(chunk.split(8 * 1024 * 1024), vec![chunk.clone()]);
    }

    #[test]
    fn test_split_keeps_delay_and_attempts() {
        let mut chunk = Chunk::new(2, 0, 100_000);
        chunk.delay_spent = 3;
        chunk.attempts = 2;

        let pieces = chunk.split(MIN_CHUNK_SIZE);
        assert_eq!(pieces.len(), 4);
        for piece in &pieces {
            assert_eq!(piece.part, 2);
            assert_eq!(piece.delay_spent, 3);
            assert_eq!(piece.attempts, 2);
        }
    }

    #[test]
    fn test_replace_and_mark_done() {
        let mut planner = PartPlanner::new(100_000, DEFAULT_PART_SIZE);
        let chunk = planner.initial_chunks().remove(0);
        let pieces = chunk.split(MIN_CHUNK_SIZE);
        planner.replace(&chunk, &pieces).unwrap();
        assert_tiles(&planner.chunk_ranges(1), 0..100_000);

        for (i, piece) in pieces.iter().enumerate() {
            let done = planner.mark_done(piece, format!("etag-{}", i)).unwrap();
            assert_eq!(done, i == pieces.len() - 1);
        }
        assert!(planner.is_part_done(1));
        assert!(planner.is_complete());
        assert_eq!(planner.uploaded_bytes(), 100_000);

        // 拆分后不再有唯一 ETag
        assert!(planner.etags().is_err());
    }

    #[test]
    fn test_replace_rejects_stale_chunk() {
        let mut planner = PartPlanner::new(100_000, DEFAULT_PART_SIZE);
        let chunk = planner.initial_chunks().remove(0);
        let pieces = chunk.split(50_000);
        planner.replace(&chunk, &pieces).unwrap();

        // 原分片已不在规划中
        assert!(planner.replace(&chunk, &pieces).is_err());
        assert!(planner.mark_done(&chunk, "etag".to_string()).is_err());
        assert!(!planner.is_part_done(1));
    }

    #[test]
    fn test_replace_rejects_gaps() {
        let mut planner = PartPlanner::new(100_000, DEFAULT_PART_SIZE);
        let chunk = planner.initial_chunks().remove(0);
        let pieces = vec![Chunk::new(1, 0, 40_000), Chunk::new(1, 50_000, 50_000)];
        assert!(planner.replace(&chunk, &pieces).is_err());
        assert_tiles(&planner.chunk_ranges(1), 0..100_000);
    }

    #[test]
    fn test_etags_in_part_order() {
        let mut planner = PartPlanner::new(3 * DEFAULT_PART_SIZE, DEFAULT_PART_SIZE);
        let mut chunks = planner.initial_chunks();
        chunks.reverse();
        for chunk in &chunks {
            planner
                .mark_done(chunk, format!("etag-{}", chunk.part))
                .unwrap();
        }
        let etags = planner.etags().unwrap();
        let numbers: Vec<u32> = etags.iter().map(|e| e.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(etags[2].etag, "etag-3");
    }

    #[test]
    fn test_commit_flag() {
        let mut planner = PartPlanner::new(10, DEFAULT_PART_SIZE);
        assert!(!planner.is_committed(1));
        planner.mark_committed(1).unwrap();
        assert!(planner.is_committed(1));
        assert!(planner.mark_committed(2).is_err());
    }

    proptest! {
        #[test]
        fn prop_parts_tile_file(size in 0u64..50_000_000, part_size in 1u64..20_000_000) {
            let planner = PartPlanner::new(size, part_size);
            let ranges: Vec<Range<u64>> = planner.parts().iter().map(Part::range).collect();
            assert_tiles(&ranges, 0..size);
            for (i, part) in planner.parts().iter().enumerate() {
                prop_assert_eq!(part.number as usize, i + 1);
                prop_assert_eq!(part.offset, i as u64 * part_size);
            }
        }

        #[test]
        fn prop_chunks_cover_part_after_splits(
            size in 1u64..(8 * 1024 * 1024),
            splits in proptest::collection::vec((0usize..64, 1u64..(4 * 1024 * 1024)), 0..12),
        ) {
            let mut planner = PartPlanner::new(size, DEFAULT_PART_SIZE);
            for (pick, chunk_size) in splits {
                let ranges = planner.chunk_ranges(1);
                let range = &ranges[pick % ranges.len()];
                let chunk = Chunk::new(1, range.start, range.end - range.start);
                let pieces = chunk.split(chunk_size);
                planner.replace(&chunk, &pieces).unwrap();
                assert_tiles(&planner.chunk_ranges(1), 0..size);
            }
        }
    }
}
