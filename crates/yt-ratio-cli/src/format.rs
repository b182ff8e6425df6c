use yt_ratio_core::{Bucket, VideoRecord};

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

pub(crate) fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub(crate) fn ratio(value: f64) -> String {
    format!("{value:.2}")
}

pub(crate) fn watch_url(id: &str) -> String {
    format!("{WATCH_URL_PREFIX}{id}")
}

pub(crate) fn bucket_heading(bucket: &Bucket) -> String {
    if bucket.upper == u64::MAX {
        format!("{}+ views", thousands(bucket.lower))
    } else {
        format!(
            "{} - {} views",
            thousands(bucket.lower),
            thousands(bucket.upper)
        )
    }
}

pub(crate) fn print_rankings(buckets: &[Bucket]) {
    println!("Rankings of likes / dislikes ratios grouped by view count");
    if buckets.is_empty() {
        println!("(no video has reached the ranking floor yet)");
        return;
    }

    for bucket in buckets {
        println!();
        println!("{}", bucket_heading(bucket));
        println!("{:>4} {:>8}  title", "#", "ratio");
        for (position, record) in bucket.entries.iter().enumerate() {
            println!(
                "{:>4} {:>8}  {}  {}",
                position + 1,
                ratio(record.ratio),
                record.title,
                watch_url(&record.id)
            );
        }
    }
}

pub(crate) fn print_records(records: &[VideoRecord]) {
    println!(
        "{:<16} {:>14} {:>10} {:>10} {:>8}  title",
        "id", "views", "likes", "dislikes", "ratio"
    );
    println!("{}", "-".repeat(80));
    for record in records {
        println!(
            "{:<16} {:>14} {:>10} {:>10} {:>8}  {}",
            record.id,
            thousands(record.view_count),
            thousands(record.likes),
            thousands(record.dislikes),
            ratio(record.ratio),
            record.title
        );
    }
}
