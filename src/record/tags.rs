//! Property identifiers the navigator and CLI look at.

pub const NAMEID_STREAM_GUID: u16    = 0x0002;
pub const NAMEID_STREAM_ENTRY: u16   = 0x0003;
pub const NAMEID_STREAM_STRING: u16  = 0x0004;
pub const MESSAGE_CLASS: u16         = 0x001A;
pub const SUBJECT: u16               = 0x0037;
pub const CLIENT_SUBMIT_TIME: u16    = 0x0039;
pub const SENT_REPRESENTING_NAME: u16 = 0x0042;
pub const CONVERSATION_TOPIC: u16    = 0x0070;
pub const TRANSPORT_HEADERS: u16     = 0x007D;
pub const RECIPIENT_TYPE: u16        = 0x0C15;
pub const SENDER_NAME: u16           = 0x0C1A;
pub const SENDER_EMAIL_ADDRESS: u16  = 0x0C1F;
pub const MESSAGE_FLAGS: u16         = 0x0E07;
pub const MESSAGE_SIZE: u16          = 0x0E08;
pub const DISPLAY_TO: u16            = 0x0E04;
pub const DISPLAY_CC: u16            = 0x0E03;
pub const MESSAGE_DELIVERY_TIME: u16 = 0x0E06;
pub const HAS_ATTACHMENTS: u16       = 0x0E1B;
pub const ATTACH_SIZE: u16           = 0x0E20;
pub const BODY: u16                  = 0x1000;
pub const RTF_COMPRESSED: u16        = 0x1009;
pub const BODY_HTML: u16             = 0x1013;
pub const DISPLAY_NAME: u16          = 0x3001;
pub const ADDRESS_TYPE: u16          = 0x3002;
pub const EMAIL_ADDRESS: u16         = 0x3003;
pub const CREATION_TIME: u16         = 0x3007;
pub const LAST_MODIFICATION_TIME: u16 = 0x3008;
pub const RECORD_KEY: u16            = 0x0FF9;
pub const ENTRY_ID: u16              = 0x0FFF;
pub const VALID_FOLDER_MASK: u16     = 0x35DF;
pub const IPM_SUBTREE_ENTRY_ID: u16  = 0x35E0;
pub const CONTENT_COUNT: u16         = 0x3602;
pub const CONTENT_UNREAD_COUNT: u16  = 0x3603;
pub const SUBFOLDERS: u16            = 0x360A;
pub const CONTAINER_CLASS: u16       = 0x3613;
pub const ATTACH_DATA: u16           = 0x3701;
pub const ATTACH_FILENAME: u16       = 0x3704;
pub const ATTACH_METHOD: u16         = 0x3705;
pub const ATTACH_LONG_FILENAME: u16  = 0x3707;
pub const ATTACH_MIME_TAG: u16       = 0x370E;
pub const MESSAGE_CODEPAGE: u16      = 0x3FFD;
pub const INTERNET_CODEPAGE: u16     = 0x3FDE;
pub const LTP_ROW_ID: u16            = 0x67F2;
pub const LTP_ROW_VERSION: u16       = 0x67F3;

/// `ATTACH_METHOD` values.
pub const ATTACH_BY_VALUE: i32         = 1;
pub const ATTACH_BY_REFERENCE: i32     = 2;
pub const ATTACH_EMBEDDED_MESSAGE: i32 = 5;
pub const ATTACH_OLE: i32              = 6;

/// Short names for the identifiers above, for display.
pub fn name(id: u16) -> Option<&'static str> {
    Some(match id {
        NAMEID_STREAM_GUID     => "NameidStreamGuid",
        NAMEID_STREAM_ENTRY    => "NameidStreamEntry",
        NAMEID_STREAM_STRING   => "NameidStreamString",
        MESSAGE_CLASS          => "MessageClass",
        SUBJECT                => "Subject",
        CLIENT_SUBMIT_TIME     => "ClientSubmitTime",
        SENT_REPRESENTING_NAME => "SentRepresentingName",
        CONVERSATION_TOPIC     => "ConversationTopic",
        TRANSPORT_HEADERS      => "TransportMessageHeaders",
        RECIPIENT_TYPE         => "RecipientType",
        SENDER_NAME            => "SenderName",
        SENDER_EMAIL_ADDRESS   => "SenderEmailAddress",
        MESSAGE_FLAGS          => "MessageFlags",
        MESSAGE_SIZE           => "MessageSize",
        DISPLAY_TO             => "DisplayTo",
        DISPLAY_CC             => "DisplayCc",
        MESSAGE_DELIVERY_TIME  => "MessageDeliveryTime",
        HAS_ATTACHMENTS        => "HasAttachments",
        ATTACH_SIZE            => "AttachSize",
        BODY                   => "Body",
        RTF_COMPRESSED         => "RtfCompressed",
        BODY_HTML              => "BodyHtml",
        DISPLAY_NAME           => "DisplayName",
        ADDRESS_TYPE           => "AddressType",
        EMAIL_ADDRESS          => "EmailAddress",
        CREATION_TIME          => "CreationTime",
        LAST_MODIFICATION_TIME => "LastModificationTime",
        RECORD_KEY             => "RecordKey",
        ENTRY_ID               => "EntryId",
        VALID_FOLDER_MASK      => "ValidFolderMask",
        IPM_SUBTREE_ENTRY_ID   => "IpmSubtreeEntryId",
        CONTENT_COUNT          => "ContentCount",
        CONTENT_UNREAD_COUNT   => "ContentUnreadCount",
        SUBFOLDERS             => "Subfolders",
        CONTAINER_CLASS        => "ContainerClass",
        ATTACH_DATA            => "AttachData",
        ATTACH_FILENAME        => "AttachFilename",
        ATTACH_METHOD          => "AttachMethod",
        ATTACH_LONG_FILENAME   => "AttachLongFilename",
        ATTACH_MIME_TAG        => "AttachMimeTag",
        MESSAGE_CODEPAGE       => "MessageCodepage",
        INTERNET_CODEPAGE      => "InternetCodepage",
        LTP_ROW_ID             => "LtpRowId",
        LTP_ROW_VERSION        => "LtpRowVersion",
        _ => return None,
    })
}
