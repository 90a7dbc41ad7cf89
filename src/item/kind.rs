//! Item classification from node type and message class.

use serde::Serialize;

use crate::index::{NodeType, NID_MESSAGE_STORE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Undefined,
    MessageStore,
    Folder,
    SubFolders,
    SubMessages,
    SubAssociatedContents,
    Email,
    EmailSmime,
    Appointment,
    Meeting,
    Contact,
    DistributionList,
    Note,
    Task,
    TaskRequest,
    Activity,
    PostingNote,
    RssFeed,
    Document,
    Configuration,
    ConflictMessage,
    Sharing,
    Fax,
    Voicemail,
    Attachment,
    Recipients,
}

/// Message class prefixes, most specific first. A prefix matches the
/// whole class or a class continuing with `.`.
const CLASSES: &[(&str, ItemType)] = &[
    ("IPM.Note.Microsoft.Voicemail", ItemType::Voicemail),
    ("IPM.Note.Microsoft.Fax",       ItemType::Fax),
    ("IPM.Note.SMIME",               ItemType::EmailSmime),
    ("REPORT.IPM.Note",              ItemType::Email),
    ("IPM.Note",                     ItemType::Email),
    ("IPM.Schedule.Meeting",         ItemType::Meeting),
    ("IPM.Appointment",              ItemType::Appointment),
    ("IPM.Contact",                  ItemType::Contact),
    ("IPM.DistList",                 ItemType::DistributionList),
    ("IPM.StickyNote",               ItemType::Note),
    ("IPM.TaskRequest",              ItemType::TaskRequest),
    ("IPM.Task",                     ItemType::Task),
    ("IPM.Activity",                 ItemType::Activity),
    ("IPM.Post.RSS",                 ItemType::RssFeed),
    ("IPM.Post",                     ItemType::PostingNote),
    ("IPM.Document",                 ItemType::Document),
    ("IPM.Configuration",            ItemType::Configuration),
    ("IPM.Microsoft.ScheduleData.FreeBusy", ItemType::Configuration),
    ("IPM.Conflict",                 ItemType::ConflictMessage),
    ("IPM.Sharing",                  ItemType::Sharing),
    ("IPM",                          ItemType::Email),
];

fn class_matches(class: &str, prefix: &str) -> bool {
    class.len() >= prefix.len()
        && class.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
        && matches!(class.as_bytes().get(prefix.len()), None | Some(b'.'))
}

impl ItemType {
    pub fn from_message_class(class: &str) -> Self {
        CLASSES
            .iter()
            .find(|(prefix, _)| class_matches(class, prefix))
            .map_or(ItemType::Undefined, |&(_, kind)| kind)
    }

    /// Type of a descriptor-backed node; messages need their class.
    pub fn for_descriptor(id: u32, message_class: Option<&str>) -> Self {
        if id == NID_MESSAGE_STORE {
            return ItemType::MessageStore;
        }
        match NodeType::of(id) {
            NodeType::Folder | NodeType::SearchFolder   => ItemType::Folder,
            NodeType::HierarchyTable                    => ItemType::SubFolders,
            NodeType::ContentsTable                     => ItemType::SubMessages,
            NodeType::AssociatedContentsTable           => ItemType::SubAssociatedContents,
            NodeType::RecipientTable                    => ItemType::Recipients,
            NodeType::Attachment                        => ItemType::Attachment,
            NodeType::Message | NodeType::AssociatedMessage => {
                message_class.map_or(ItemType::Undefined, Self::from_message_class)
            }
            _ => ItemType::Undefined,
        }
    }

    pub fn is_folder(self) -> bool {
        self == ItemType::Folder
    }

    pub fn is_message(self) -> bool {
        !matches!(
            self,
            ItemType::Undefined
                | ItemType::MessageStore
                | ItemType::Folder
                | ItemType::SubFolders
                | ItemType::SubMessages
                | ItemType::SubAssociatedContents
                | ItemType::Attachment
                | ItemType::Recipients
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(ItemType::from_message_class("IPM.Note"), ItemType::Email);
        assert_eq!(ItemType::from_message_class("ipm.note.custom"), ItemType::Email);
        assert_eq!(ItemType::from_message_class("IPM.Note.SMIME.MultipartSigned"), ItemType::EmailSmime);
        assert_eq!(ItemType::from_message_class("IPM.TaskRequest.Accept"), ItemType::TaskRequest);
        assert_eq!(ItemType::from_message_class("IPM.Task"), ItemType::Task);
        assert_eq!(ItemType::from_message_class("IPM.Appointment"), ItemType::Appointment);
        assert_eq!(ItemType::from_message_class("IPM.Post.RSS"), ItemType::RssFeed);
        assert_eq!(ItemType::from_message_class("IPMX"), ItemType::Undefined);
        assert_eq!(ItemType::from_message_class(""), ItemType::Undefined);
    }

    #[test]
    fn descriptors() {
        assert_eq!(ItemType::for_descriptor(0x21, None), ItemType::MessageStore);
        assert_eq!(ItemType::for_descriptor(0x122, None), ItemType::Folder);
        assert_eq!(ItemType::for_descriptor(0x12D, None), ItemType::SubFolders);
        assert_eq!(ItemType::for_descriptor(0x200004, Some("IPM.Contact")), ItemType::Contact);
        assert_eq!(ItemType::for_descriptor(0x200004, None), ItemType::Undefined);
        assert!(ItemType::Email.is_message());
        assert!(!ItemType::Folder.is_message());
    }
}
