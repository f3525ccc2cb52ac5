mod phash;
mod text;

pub use phash::BubbleImageDeduplicator;
pub use text::MessageDeduplicator;
