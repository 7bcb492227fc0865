use crate::models::{ ChunkDraft, TranscriptItem };

pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Groups spoken items into drafts of `chunk_size` words; a trailing partial group is kept.
///
/// Punctuation and other non-word items are skipped. A spoken item without a usable
/// timestamp inherits the last known time so that `start_time <= end_time` always holds
/// and drafts stay in chronological order.
pub fn chunk(items: &[TranscriptItem], chunk_size: usize) -> Vec<ChunkDraft> {
    let chunk_size = chunk_size.max(1);
    let mut drafts = Vec::new();
    let mut words: Vec<&str> = Vec::with_capacity(chunk_size);
    let mut start = 0.0_f64;
    let mut end = 0.0_f64;
    let mut clock = 0.0_f64;

    for item in items.iter().filter(|item| item.is_spoken()) {
        let item_start = item.start_seconds().unwrap_or(clock).max(clock);
        let item_end = item.end_seconds().unwrap_or(item_start).max(item_start);
        clock = item_end;

        if words.is_empty() {
            start = item_start;
        }
        end = item_end;
        words.push(item.content());

        if words.len() >= chunk_size {
            drafts.push(draft(&words, start, end));
            words.clear();
        }
    }
    if !words.is_empty() {
        drafts.push(draft(&words, start, end));
    }
    drafts
}

fn draft(words: &[&str], start_time: f64, end_time: f64) -> ChunkDraft {
    ChunkDraft {
        text: words.join(" "),
        start_time,
        end_time,
        word_count: words.len(),
    }
}
