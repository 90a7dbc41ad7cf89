use pffkit::btree::{reseal_page, PageLayout};
use pffkit::config::{IndexMode, OpenOptions};
use pffkit::container::Container;
use pffkit::error::ErrorKind;
use pffkit::handle::FileHandle;
use pffkit::header::{EncryptionType, FormatVariant};
use pffkit::integrity::{self, IntegrityQuality};
use pffkit::item::{Item, ItemOrigin, ItemType};
use pffkit::record::names::{PropertyName, PS_PUBLIC_STRINGS};
use pffkit::record::{tags, PropertyRecord, PropertyValue};
use pffkit::writer::{AttachmentSpec, BuildOptions, ContainerBuilder, MessageSpec};
use pffkit::AccessFlags;
use tempfile::NamedTempFile;
use uuid::Uuid;

const VARIANTS: [FormatVariant; 3] = [FormatVariant::Ansi, FormatVariant::Unicode, FormatVariant::Unicode4k];

fn text(variant: FormatVariant, s: &str) -> PropertyValue {
    match variant {
        FormatVariant::Ansi => PropertyValue::String8(s.to_owned()),
        _                   => PropertyValue::Unicode(s.to_owned()),
    }
}

fn name(variant: FormatVariant, s: &str) -> Vec<PropertyRecord> {
    vec![PropertyRecord::new(tags::DISPLAY_NAME, text(variant, s))]
}

fn email(variant: FormatVariant, subject: &str) -> MessageSpec {
    MessageSpec::new()
        .property(tags::MESSAGE_CLASS, text(variant, "IPM.Note"))
        .property(tags::SUBJECT, text(variant, subject))
}

/// Store, Inbox with two messages, Archive with a sub-folder.
fn mailbox(options: BuildOptions) -> Vec<u8> {
    let variant = options.variant;
    let mut builder = ContainerBuilder::new(options);
    builder.add_message_store(name(variant, "Personal Folders"));
    let inbox = builder.add_folder(builder.root(), name(variant, "Inbox"));
    let archive = builder.add_folder(builder.root(), name(variant, "Archive"));
    builder.add_folder(archive, name(variant, "2023"));
    builder.add_message(
        inbox,
        email(variant, "quarterly report")
            .recipient(vec![
                PropertyRecord::new(tags::DISPLAY_NAME, text(variant, "Alice")),
                PropertyRecord::new(tags::RECIPIENT_TYPE, PropertyValue::Integer32(1)),
            ])
            .recipient(vec![
                PropertyRecord::new(tags::DISPLAY_NAME, text(variant, "Bob")),
                PropertyRecord::new(tags::RECIPIENT_TYPE, PropertyValue::Integer32(2)),
            ])
            .attachment(AttachmentSpec::by_value("notes.txt", b"see figures".to_vec())),
    );
    builder.add_message(inbox, email(variant, "lunch?"));
    builder.build().unwrap().bytes
}

fn open(bytes: Vec<u8>) -> Container {
    Container::open_bytes(bytes, OpenOptions::default()).unwrap()
}

fn child_named<'c>(parent: &Item<'c>, wanted: &str) -> Item<'c> {
    parent
        .sub_folders()
        .unwrap()
        .into_iter()
        .find(|f| f.display_name().unwrap().as_deref() == Some(wanted))
        .unwrap()
}

/// `(depth, type, label)` for every item reachable from the root.
fn outline(container: &Container) -> Vec<(usize, ItemType, String)> {
    fn visit(item: &Item<'_>, depth: usize, out: &mut Vec<(usize, ItemType, String)>) {
        let label = item
            .display_name()
            .unwrap()
            .or_else(|| item.subject().unwrap())
            .or_else(|| item.filename().unwrap())
            .unwrap_or_default();
        out.push((depth, item.item_type().unwrap(), label));
        for child in item.children() {
            visit(&child.unwrap(), depth + 1, out);
        }
    }
    let mut out = Vec::new();
    visit(&container.open_root().unwrap(), 0, &mut out);
    out
}

// ── Opening ──────────────────────────────────────────────────────────────────

#[test]
fn minimal_container_has_empty_root() {
    for variant in VARIANTS {
        let file = NamedTempFile::new().unwrap();
        ContainerBuilder::new(BuildOptions::new(variant)).build().unwrap().write_to(file.path()).unwrap();

        let pst = Container::open(file.path(), OpenOptions::default()).unwrap();
        assert_eq!(pst.variant(), variant);
        let root = pst.open_root().unwrap();
        assert_eq!(root.id(), 0x122);
        assert_eq!(root.item_type().unwrap(), ItemType::Folder);
        assert_eq!(root.children().count(), 0);
        assert!(root.properties().unwrap().is_empty());
        pst.close().unwrap();
    }
}

#[test]
fn flipped_magic_is_invalid_signature() {
    let mut bytes = mailbox(BuildOptions::new(FormatVariant::Unicode));
    bytes[0] ^= 0xFF;
    let err = Container::open_bytes(bytes, OpenOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSignature);
}

#[test]
fn truncated_file_is_rejected() {
    let bytes = mailbox(BuildOptions::new(FormatVariant::Ansi));
    let err = Container::open_bytes(bytes[..100].to_vec(), OpenOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptHeader);
}

#[test]
fn self_pointing_page_is_corrupt_table() {
    for variant in VARIANTS {
        let mut builder = ContainerBuilder::new(BuildOptions::new(variant).max_page_entries(2));
        for i in 0..6 {
            builder.add_folder(builder.root(), name(variant, &format!("folder {i}")));
        }
        let built = builder.build().unwrap();
        assert!(built.offsets_depth > 0);

        let root = built.header.offsets_root;
        let mut bytes = built.bytes;
        let layout = PageLayout::new(variant);
        let w = variant.id_size();
        let at = root.offset as usize;
        let page = &mut bytes[at..at + layout.page_size()];
        // First branch entry: key, child id, child offset.
        write_id(&mut page[w..], w, root.id);
        write_id(&mut page[2 * w..], w, root.offset);
        reseal_page(&layout, page);

        let err = Container::open_bytes(bytes, OpenOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptAllocationTable, "{variant:?}");
    }
}

fn write_id(buf: &mut [u8], width: usize, value: u64) {
    buf[..width].copy_from_slice(&value.to_le_bytes()[..width]);
}

#[test]
fn read_past_end_is_out_of_bounds() {
    let pst = open(mailbox(BuildOptions::new(FormatVariant::Unicode)));
    let reader = pst.store().reader();
    let err = reader.read_at(pst.size(), 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfBounds);
    assert!(reader.read_at(pst.size() - 1, 1).is_ok());
}

#[test]
fn close_releases_source() {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), mailbox(BuildOptions::new(FormatVariant::Ansi))).unwrap();

    let pst = Container::open(file.path(), OpenOptions::default()).unwrap();
    let probe = pst.probe();
    assert!(!probe.is_released());
    pst.close().unwrap();
    assert!(probe.is_released());

    let probe = Container::with_open(file.path(), OpenOptions::default(), |pst| Ok(pst.probe())).unwrap();
    assert!(probe.is_released());
}

#[test]
fn unknown_descriptor() {
    let pst = open(mailbox(BuildOptions::new(FormatVariant::Unicode)));
    let err = pst.item(0x7FFF_FFE2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownDescriptor);
}

// ── Navigation ───────────────────────────────────────────────────────────────

#[test]
fn variants_navigate_identically() {
    let outlines: Vec<_> = VARIANTS
        .iter()
        .map(|&v| outline(&open(mailbox(BuildOptions::new(v)))))
        .collect();
    assert_eq!(outlines[0], outlines[1]);
    assert_eq!(outlines[1], outlines[2]);

    let labels: Vec<&str> = outlines[0].iter().map(|(_, _, l)| l.as_str()).collect();
    assert!(labels.contains(&"Inbox"));
    assert!(labels.contains(&"2023"));
    assert!(labels.contains(&"notes.txt"));
}

#[test]
fn children_point_back_at_parent() {
    let pst = open(mailbox(BuildOptions::new(FormatVariant::Unicode)));
    let root = pst.open_root().unwrap();
    let folders = root.sub_folders().unwrap();
    assert_eq!(folders.len(), 2);
    for folder in &folders {
        assert_eq!(folder.node().parent, root.id());
        assert_eq!(folder.origin(), ItemOrigin::Descriptor);
        for child in folder.children() {
            assert_eq!(child.unwrap().node().parent, folder.id());
        }
    }
}

#[test]
fn properties_are_stable() {
    let pst = open(mailbox(BuildOptions::new(FormatVariant::Unicode)));
    let inbox = child_named(&pst.open_root().unwrap(), "Inbox");
    let first = inbox.properties().unwrap().clone();
    let again = pst.item(inbox.id()).unwrap();
    assert_eq!(&first, again.properties().unwrap());
    assert_eq!(&first, inbox.properties().unwrap());
}

#[test]
fn message_store_is_reachable() {
    let pst = open(mailbox(BuildOptions::new(FormatVariant::Ansi)));
    let store = pst.message_store().unwrap();
    assert_eq!(store.item_type().unwrap(), ItemType::MessageStore);
    assert_eq!(store.display_name().unwrap().as_deref(), Some("Personal Folders"));
}

#[test]
fn named_properties_resolve_through_the_map() {
    let common = Uuid::from_u128(0x00062008_0000_0000_c000_000000000046);
    for variant in VARIANTS {
        let mut names = vec![
            (PS_PUBLIC_STRINGS, PropertyName::String("Keywords".into())),
            (common, PropertyName::Numeric(0x8503)),
        ];
        // Enough entries to push the streams out of the heap into sub-nodes.
        names.extend((0..600).map(|i| (common, PropertyName::String(format!("x-field-{i}")))));

        let mut builder = ContainerBuilder::new(BuildOptions::new(variant));
        builder.add_name_to_id_map(&names);
        let inbox = builder.add_folder(builder.root(), name(variant, "Inbox"));
        let message = builder.add_message(
            inbox,
            email(variant, "tagged").property(0x8000, text(variant, "urgent")),
        );
        let pst = open(builder.build().unwrap().bytes);

        let map = pst.name_to_id_map().unwrap();
        assert_eq!(map.len(), 602);
        assert!(map.issues().is_empty());
        let keywords = pst.named_property(0x8000).unwrap().unwrap();
        assert_eq!(keywords.guid, PS_PUBLIC_STRINGS);
        assert_eq!(keywords.name, PropertyName::String("Keywords".into()));
        assert_eq!(pst.named_property(0x8001).unwrap().unwrap().name, PropertyName::Numeric(0x8503));
        assert_eq!(map.lookup(common, &PropertyName::String("x-field-599".into())), Some(0x8000 + 601));
        assert!(pst.named_property(0x8000 + 602).unwrap().is_none());

        let item = pst.item(message).unwrap();
        assert_eq!(item.properties().unwrap().string(0x8000), Some("urgent"));
    }
}

#[test]
fn container_without_name_map() {
    let pst = open(mailbox(BuildOptions::new(FormatVariant::Unicode)));
    assert!(pst.name_to_id_map().unwrap().is_empty());
    assert!(pst.named_property(0x8000).unwrap().is_none());
}

#[test]
fn messages_recipients_attachments() {
    for variant in VARIANTS {
        let pst = open(mailbox(BuildOptions::new(variant)));
        let inbox = child_named(&pst.open_root().unwrap(), "Inbox");
        let messages = inbox.sub_messages().unwrap();
        assert_eq!(messages.len(), 2);

        let report = &messages[0];
        assert_eq!(report.item_type().unwrap(), ItemType::Email);
        assert_eq!(report.subject().unwrap().as_deref(), Some("quarterly report"));

        let recipients = report.recipients().unwrap();
        let names: Vec<_> = recipients.iter().map(|r| r.properties.string(tags::DISPLAY_NAME).unwrap()).collect();
        assert_eq!(names, ["Alice", "Bob"]);
        assert_eq!(recipients[1].properties.integer(tags::RECIPIENT_TYPE), Some(2));

        let attachments = report.attachments().unwrap();
        assert_eq!(attachments.len(), 1);
        let attachment = &attachments[0];
        assert_eq!(attachment.item_type().unwrap(), ItemType::Attachment);
        assert_eq!(attachment.filename().unwrap().as_deref(), Some("notes.txt"));
        assert_eq!(attachment.read_data().unwrap().as_deref(), Some(&b"see figures"[..]));
        assert_eq!(attachment.size().unwrap(), Some(11));

        assert!(messages[1].attachments().unwrap().is_empty());
        assert!(messages[1].recipients().unwrap().is_empty());
    }
}

#[test]
fn large_attachment_reads_back() {
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    for variant in VARIANTS {
        let mut builder = ContainerBuilder::new(BuildOptions::new(variant));
        builder.add_message(
            builder.root(),
            email(variant, "big").attachment(AttachmentSpec::by_value("blob.bin", payload.clone())),
        );
        let pst = open(builder.build().unwrap().bytes);
        let message = &pst.open_root().unwrap().sub_messages().unwrap()[0];
        let attachment = &message.attachments().unwrap()[0];
        assert_eq!(attachment.read_data().unwrap().unwrap(), payload, "{variant:?}");
    }
}

#[test]
fn embedded_message() {
    let variant = FormatVariant::Unicode;
    let inner = email(variant, "forwarded")
        .attachment(AttachmentSpec::by_value("inner.txt", b"nested".to_vec()));
    let mut builder = ContainerBuilder::new(BuildOptions::new(variant));
    builder.add_message(builder.root(), email(variant, "outer").attachment(AttachmentSpec::embedded(inner)));
    let pst = open(builder.build().unwrap().bytes);

    let outer = &pst.open_root().unwrap().sub_messages().unwrap()[0];
    let attachment = &outer.attachments().unwrap()[0];
    assert_eq!(attachment.attach_method().unwrap(), Some(tags::ATTACH_EMBEDDED_MESSAGE as i64));

    let embedded = attachment.embedded_message().unwrap().unwrap();
    assert_eq!(embedded.origin(), ItemOrigin::EmbeddedMessage);
    assert_eq!(embedded.item_type().unwrap(), ItemType::Email);
    assert_eq!(embedded.subject().unwrap().as_deref(), Some("forwarded"));

    let via_children: Vec<_> = attachment.children().map(Result::unwrap).collect();
    assert_eq!(via_children.len(), 1);
    assert_eq!(via_children[0].id(), embedded.id());

    let nested = &embedded.attachments().unwrap()[0];
    assert_eq!(nested.read_data().unwrap().as_deref(), Some(&b"nested"[..]));
}

#[test]
fn encrypted_and_compressed_containers() {
    let cases = [
        BuildOptions::new(FormatVariant::Ansi).encryption(EncryptionType::Compressible),
        BuildOptions::new(FormatVariant::Unicode).encryption(EncryptionType::High),
        BuildOptions::new(FormatVariant::Unicode4k).compress(true),
        BuildOptions::new(FormatVariant::Unicode4k).encryption(EncryptionType::High).compress(true),
    ];
    let plain = outline(&open(mailbox(BuildOptions::new(FormatVariant::Unicode))));
    for options in cases {
        let encryption = options.encryption;
        let pst = open(mailbox(options));
        assert_eq!(pst.encryption(), encryption);
        assert_eq!(outline(&pst), plain);
    }
}

#[test]
fn eager_and_paged_agree() {
    let mut builder = ContainerBuilder::new(BuildOptions::new(FormatVariant::Ansi).max_page_entries(3));
    let mut parent = builder.root();
    for i in 0..10 {
        parent = builder.add_folder(parent, name(FormatVariant::Ansi, &format!("level {i}")));
        builder.add_message(parent, email(FormatVariant::Ansi, &format!("note {i}")));
    }
    let bytes = builder.build().unwrap().bytes;

    let paged = Container::open_bytes(bytes.clone(), OpenOptions::default()).unwrap();
    let eager = Container::open_bytes(bytes, OpenOptions::default().index_mode(IndexMode::Eager)).unwrap();
    assert_eq!(outline(&paged), outline(&eager));
    assert_eq!(outline(&paged).len(), 21);

    let deepest = |pst: &Container| {
        let last = pst.descriptors().iter().map(Result::unwrap).map(|n| n.id).max().unwrap();
        pst.descriptors().lineage(last).unwrap()
    };
    assert_eq!(deepest(&eager), deepest(&paged));
    assert_eq!(deepest(&eager).len(), 11);
}

// ── Integrity ────────────────────────────────────────────────────────────────

#[test]
fn integrity_scan_flags_damage() {
    let variant = FormatVariant::Unicode;
    let mut builder = ContainerBuilder::new(BuildOptions::new(variant));
    let inbox = builder.add_folder(builder.root(), name(variant, "Inbox"));
    let built = builder.build().unwrap();
    let block = *built.block(built.descriptor(inbox).unwrap().data_id).unwrap();

    let clean = open(built.bytes.clone());
    assert_eq!(integrity::scan::<fn(u64, u64)>(&clean, None).quality, IntegrityQuality::Intact);

    let mut bytes = built.bytes;
    bytes[block.offset as usize + 4] ^= 0xA5;
    let damaged = Container::open_bytes(bytes, OpenOptions::default()).unwrap();
    let report = integrity::scan::<fn(u64, u64)>(&damaged, None);
    assert_eq!(report.quality, IntegrityQuality::Degraded);
    assert_eq!(report.block_log.len(), 1);
    assert_eq!(report.block_log[0].id, block.id);

    let inbox = damaged.item(inbox).unwrap();
    assert_eq!(inbox.properties().unwrap_err().kind(), ErrorKind::MalformedRecord);
}

#[test]
fn damaged_child_does_not_hide_its_siblings() {
    for mode in [IndexMode::Paged, IndexMode::Eager] {
        let variant = FormatVariant::Unicode;
        let mut builder = ContainerBuilder::new(BuildOptions::new(variant));
        let a = builder.add_folder(builder.root(), name(variant, "A"));
        let b = builder.add_folder(builder.root(), name(variant, "B"));
        let built = builder.build().unwrap();
        let block = *built.block(built.descriptor(a).unwrap().data_id).unwrap();

        let mut bytes = built.bytes;
        bytes[block.offset as usize + 4] ^= 0xA5;
        let pst = Container::open_bytes(bytes, OpenOptions::default().index_mode(mode)).unwrap();
        let root = pst.open_root().unwrap();
        let children: Vec<Item<'_>> = root.children().collect::<Result<_, _>>().unwrap();
        assert_eq!(children.len(), 2);

        let damaged = children.iter().find(|c| c.id() == a).unwrap();
        let err = damaged.properties().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
        assert!(err.to_string().contains(&format!("{a:#x}")), "{err}");

        let sibling = children.iter().find(|c| c.id() == b).unwrap();
        assert_eq!(sibling.display_name().unwrap().as_deref(), Some("B"));
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

#[test]
fn handle_lifecycle_over_file() {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), mailbox(BuildOptions::new(FormatVariant::Unicode4k))).unwrap();

    let handle = FileHandle::create();
    handle.open(file.path(), AccessFlags::READ).unwrap();
    let folders = handle.with_container(|pst| Ok(pst.open_root()?.sub_folders()?.len())).unwrap();
    assert_eq!(folders, 2);
    assert!(handle.is_open());
    handle.close().unwrap();
    assert_eq!(handle.close().unwrap_err().kind(), ErrorKind::InvalidHandleState);
    handle.destroy().unwrap();
}
