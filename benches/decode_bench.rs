use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pffkit::config::{CachePolicy, IndexMode, OpenOptions};
use pffkit::container::Container;
use pffkit::header::{EncryptionType, FormatVariant};
use pffkit::integrity;
use pffkit::item::Item;
use pffkit::parallel;
use pffkit::record::{tags, PropertyRecord, PropertyValue};
use pffkit::writer::{AttachmentSpec, BuildOptions, ContainerBuilder, MessageSpec};

fn mailbox(options: BuildOptions, messages: usize) -> Vec<u8> {
    let mut builder = ContainerBuilder::new(options);
    let inbox = builder.add_folder(
        builder.root(),
        vec![PropertyRecord::new(tags::DISPLAY_NAME, PropertyValue::Unicode("Inbox".into()))],
    );
    for i in 0..messages {
        let body = format!("line {i}\r\n").repeat(64);
        let mut message = MessageSpec::new()
            .property(tags::MESSAGE_CLASS, PropertyValue::Unicode("IPM.Note".into()))
            .property(tags::SUBJECT, PropertyValue::Unicode(format!("message {i}")))
            .property(tags::BODY, PropertyValue::Unicode(body))
            .recipient(vec![PropertyRecord::new(tags::DISPLAY_NAME, PropertyValue::Unicode("Dana".into()))]);
        if i % 8 == 0 {
            message = message.attachment(AttachmentSpec::by_value("report.bin", vec![i as u8; 32 * 1024]));
        }
        builder.add_message(inbox, message);
    }
    builder.build().unwrap().bytes
}

fn count_items(item: &Item<'_>) -> usize {
    let _ = black_box(item.properties().unwrap());
    1 + item.children().map(|c| count_items(&c.unwrap())).sum::<usize>()
}

fn bench_open(c: &mut Criterion) {
    let bytes = mailbox(BuildOptions::new(FormatVariant::Unicode), 500);

    c.bench_function("open_paged_500", |b| {
        b.iter(|| Container::open_bytes(black_box(bytes.clone()), OpenOptions::default()).unwrap())
    });
    c.bench_function("open_eager_500", |b| {
        let options = OpenOptions::default().index_mode(IndexMode::Eager);
        b.iter(|| Container::open_bytes(black_box(bytes.clone()), options.clone()).unwrap())
    });
}

fn bench_traverse(c: &mut Criterion) {
    let cases = [
        ("traverse_unicode_plain", BuildOptions::new(FormatVariant::Unicode)),
        ("traverse_unicode_high", BuildOptions::new(FormatVariant::Unicode).encryption(EncryptionType::High)),
        ("traverse_4k_compressed", BuildOptions::new(FormatVariant::Unicode4k).compress(true)),
    ];
    for (name, options) in cases {
        let bytes = mailbox(options, 200);
        c.bench_function(name, |b| {
            b.iter(|| {
                let pst = Container::open_bytes(bytes.clone(), OpenOptions::default()).unwrap();
                let root = pst.open_root().unwrap();
                count_items(&root)
            })
        });
    }
}

fn bench_cache(c: &mut Criterion) {
    let bytes = mailbox(BuildOptions::new(FormatVariant::Unicode), 200);
    let pst = Container::open_bytes(bytes, OpenOptions::default().cache(CachePolicy::MaxEntries(4096))).unwrap();

    c.bench_function("resolve_properties_cached_200", |b| {
        b.iter(|| {
            let inbox = &pst.open_root().unwrap().sub_folders().unwrap()[0];
            let messages = inbox.sub_messages().unwrap();
            parallel::warm(black_box(&messages))
        })
    });
}

fn bench_scan(c: &mut Criterion) {
    let bytes = mailbox(BuildOptions::new(FormatVariant::Unicode4k).compress(true), 200);
    let pst = Container::open_bytes(bytes, OpenOptions::default()).unwrap();

    c.bench_function("integrity_scan_200", |b| {
        b.iter(|| integrity::scan::<fn(u64, u64)>(black_box(&pst), None))
    });
}

criterion_group!(benches, bench_open, bench_traverse, bench_cache, bench_scan);
criterion_main!(benches);
