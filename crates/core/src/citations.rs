use crate::models::RetrievedChunk;
use std::collections::BTreeSet;

pub const DEFAULT_CITATION_HEADING: &str = "Sources:";

/// Distinct source identifiers of the chunks retrieved for one query, sorted.
pub fn collect_citations(hits: &[RetrievedChunk]) -> Vec<String> {
    hits.iter()
        .map(|hit| hit.chunk.source_name().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Markdown citation block appended after an answer, or `None` when there is
/// nothing to cite.
pub fn format_citations(citations: &[String], heading: &str) -> Option<String> {
    if citations.is_empty() {
        return None;
    }

    let mut block = format!("\n\n---\n**{heading}**");
    for name in citations {
        block.push_str(&format!("\n* `{name}`"));
    }
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Metadata, FILE_NAME_KEY};

    fn hit(file_name: &str) -> RetrievedChunk {
        let mut metadata = Metadata::new();
        metadata.insert(FILE_NAME_KEY.to_string(), file_name.to_string());
        RetrievedChunk {
            chunk: Chunk {
                chunk_id: format!("{file_name}-0"),
                document_id: file_name.to_string(),
                chunk_index: 0,
                text: String::new(),
                metadata,
                embedding: Vec::new(),
            },
            score: 0.5,
        }
    }

    #[test]
    fn citations_are_deduplicated_and_sorted() {
        let hits = vec![hit("zeta.md"), hit("alpha.txt"), hit("zeta.md")];
        assert_eq!(
            collect_citations(&hits),
            vec!["alpha.txt".to_string(), "zeta.md".to_string()]
        );
    }

    #[test]
    fn no_hits_means_no_block() {
        assert!(collect_citations(&[]).is_empty());
        assert_eq!(format_citations(&[], DEFAULT_CITATION_HEADING), None);
    }

    #[test]
    fn block_lists_each_source() {
        let block = format_citations(&["notes.txt".to_string()], DEFAULT_CITATION_HEADING).unwrap();
        assert_eq!(block, "\n\n---\n**Sources:**\n* `notes.txt`");
    }
}
