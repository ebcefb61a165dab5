use proptest::prelude::*;
use riskshield_core::{
    decrypt, encrypt, ChunkConfig, Chunker, EncryptionKey, SegmentLocation, TextSegment,
    TokenizerKind,
};

fn word_segments(n: usize) -> Vec<TextSegment> {
    let text = (0..n).map(|i| format!("t{i}")).collect::<Vec<_>>().join(" ");
    vec![TextSegment::new(text, SegmentLocation::Page(1))]
}

proptest! {
    #[test]
    fn windows_have_fixed_size_and_overlap(
        len in 0usize..400,
        chunk_size in 1usize..60,
        overlap_seed in 0usize..60,
    ) {
        let overlap = overlap_seed % chunk_size;
        let chunker = Chunker::new(ChunkConfig {
            chunk_size,
            overlap,
            tokenizer: TokenizerKind::Whitespace,
        })
        .unwrap();
        let chunks = chunker.chunk(&word_segments(len)).unwrap();

        if len == 0 {
            prop_assert!(chunks.is_empty());
        } else {
            prop_assert_eq!(chunks.first().unwrap().token_start, 0);
            prop_assert_eq!(chunks.last().unwrap().token_end, len);
        }
        for pair in chunks.windows(2) {
            prop_assert_eq!(pair[0].token_count(), chunk_size);
            prop_assert_eq!(pair[0].token_end - pair[1].token_start, overlap);
            let head: Vec<&str> = pair[0].text.split(' ').collect();
            let tail: Vec<&str> = pair[1].text.split(' ').collect();
            prop_assert_eq!(&head[chunk_size - overlap..], &tail[..overlap]);
        }
        for chunk in &chunks {
            prop_assert!(chunk.token_count() <= chunk_size);
        }
    }

    #[test]
    fn envelope_roundtrips_arbitrary_bytes(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
        let key = EncryptionKey::generate();
        let blob = encrypt(&payload, &key).unwrap();
        prop_assert_eq!(decrypt(&blob, &key).unwrap(), payload);
    }
}
