//! Codec tests over the public protocol surface.
//!
//! These exercise the encoder/decoder pairs the way a server would see them:
//! encode a request, pick it apart byte by byte, build the reply a FastDFS
//! server would send, and check the decoder recovers the original values.

use bytes::{Buf, BufMut, BytesMut};
use fastdfs_client::protocol::*;
use fastdfs_client::types::*;
use fastdfs_client::Charset;

const CS: Charset = Charset::Utf8;

#[test]
fn header_round_trips_across_the_value_range() {
    for length in [0u64, 1, 4096, u32::MAX as u64, u64::MAX] {
        for (command, status) in [(11u8, 0u8), (100, 2), (255, 255), (0, 0)] {
            let encoded = encode_header(length, command, status);
            assert_eq!(encoded.len(), FDFS_PROTO_HEADER_LEN);
            let decoded = decode_header(&encoded).unwrap();
            assert_eq!(decoded.length, length);
            assert_eq!(decoded.command, command);
            assert_eq!(decoded.status, status);
        }
    }
}

#[test]
fn header_length_is_big_endian() {
    let encoded = encode_header(0x0102_0304_0506_0708, 11, 0);
    assert_eq!(&encoded[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn tracker_requests_target_the_tracker() {
    let requests = [
        Request::QueryStoreWithoutGroup,
        Request::QueryStoreWithGroup { group: "g".into() },
        Request::QueryFetchOne {
            group: "g".into(),
            path: "p".into(),
        },
        Request::QueryUpdate {
            group: "g".into(),
            path: "p".into(),
        },
        Request::ListGroups,
        Request::ListStorages {
            group: "g".into(),
            storage_ip: None,
        },
    ];
    let expected_commands = [101u8, 104, 102, 103, 91, 92];
    for (request, expected) in requests.iter().zip(expected_commands) {
        assert_eq!(request.command(), expected);
        assert_eq!(request.role(), ServerRole::Tracker);
        assert_eq!(request.payload_len(), 0);
    }
}

#[test]
fn payload_carrying_requests_declare_their_length() {
    let upload = Request::Upload {
        store_path_index: 0,
        ext: "bin".into(),
        size: 12345,
        appender: false,
    };
    assert_eq!(upload.payload_len(), 12345);

    let append = Request::Append {
        path: "M00/x".into(),
        size: 77,
    };
    assert_eq!(append.payload_len(), 77);

    let modify = Request::Modify {
        path: "M00/x".into(),
        offset: 10,
        size: 20,
    };
    assert_eq!(modify.payload_len(), 20);

    // header length = body + payload
    let body = upload.encode_body(CS);
    assert_eq!(body.len() as u64 + upload.payload_len(), 15 + 12345);
}

#[test]
fn query_fetch_body_is_group_then_path() {
    let request = Request::QueryFetchOne {
        group: "group1".into(),
        path: "M00/00/00/file.jpg".into(),
    };
    let body = request.encode_body(CS);
    assert_eq!(body.len(), FDFS_GROUP_NAME_MAX_LEN + 18);
    assert_eq!(&body[..6], b"group1");
    assert!(body[6..FDFS_GROUP_NAME_MAX_LEN].iter().all(|&b| b == 0));
    assert_eq!(&body[FDFS_GROUP_NAME_MAX_LEN..], b"M00/00/00/file.jpg");
}

#[test]
fn upload_slave_body_layout() {
    let request = Request::UploadSlave {
        master_path: "M00/00/00/master.jpg".into(),
        prefix: "_thumb".into(),
        ext: "jpg".into(),
        size: 64,
    };
    let body = request.encode_body(CS);

    let mut buf = &body[..];
    assert_eq!(buf.get_u64(), 20); // master path length
    assert_eq!(buf.get_u64(), 64); // payload size
    let mut offset = 16;
    assert_eq!(&body[offset..offset + 6], b"_thumb");
    offset += FDFS_FILE_PREFIX_MAX_LEN;
    assert_eq!(&body[offset..offset + 3], b"jpg");
    offset += FDFS_FILE_EXT_NAME_MAX_LEN;
    assert_eq!(&body[offset..], b"M00/00/00/master.jpg");
}

#[test]
fn truncate_body_layout() {
    let request = Request::Truncate {
        path: "M00/00/00/app.log".into(),
        new_size: 1024,
    };
    let body = request.encode_body(CS);
    let mut buf = &body[..];
    assert_eq!(buf.get_u64(), 17);
    assert_eq!(buf.get_u64(), 1024);
    assert_eq!(&body[16..], b"M00/00/00/app.log");
}

#[test]
fn modify_body_layout() {
    let request = Request::Modify {
        path: "M00/a".into(),
        offset: 7,
        size: 3,
    };
    let body = request.encode_body(CS);
    let mut buf = &body[..];
    assert_eq!(buf.get_u64(), 5);
    assert_eq!(buf.get_u64(), 7);
    assert_eq!(buf.get_u64(), 3);
    assert_eq!(&body[24..], b"M00/a");
}

#[test]
fn store_and_fetch_replies_decode_like_a_server_built_them() {
    // the reply a tracker sends for query-store
    let mut reply = BytesMut::new();
    reply.put(pad_field("group2", FDFS_GROUP_NAME_MAX_LEN, CS));
    reply.put(pad_field("192.168.1.50", FDFS_IPADDR_WIRE_LEN, CS));
    reply.put_u64(23000);
    reply.put_u8(1);

    let (group, server) = decode_query_store(&reply, CS).unwrap();
    assert_eq!(group, "group2");
    assert_eq!(server.ip_addr, "192.168.1.50");
    assert_eq!(server.port, 23000);
    assert_eq!(server.store_path_index, 1);

    // the shorter fetch reply: no store path index
    let fetch = decode_fetch_server(&reply[..reply.len() - 1], CS).unwrap();
    assert_eq!(fetch.ip_addr, "192.168.1.50");
    assert_eq!(fetch.port, 23000);
}

#[test]
fn truncated_replies_fail_to_decode() {
    let mut reply = BytesMut::new();
    reply.put(pad_field("group1", FDFS_GROUP_NAME_MAX_LEN, CS));
    reply.put(pad_field("10.0.0.1", FDFS_IPADDR_WIRE_LEN, CS));
    reply.put_u64(23000);
    reply.put_u8(0);

    for cut in [0, 10, FDFS_GROUP_NAME_MAX_LEN, reply.len() - 1] {
        assert!(decode_query_store(&reply[..cut], CS).is_err(), "cut={cut}");
    }
    assert!(decode_upload_reply(b"", CS).is_err());
    assert!(decode_file_info(&[0u8; 10], CS).is_err());
}

#[test]
fn metadata_survives_unusual_values() {
    let mut metadata = Metadata::new();
    metadata.insert("path".into(), "/home/user/file.txt".into());
    metadata.insert("note".into(), "has: punctuation, and; more!".into());
    metadata.insert("empty".into(), "".into());

    let encoded = encode_metadata(&metadata, CS);
    let decoded = decode_metadata(&encoded, CS);
    assert_eq!(decoded, metadata);
}

#[test]
fn metadata_truncates_oversized_entries() {
    let mut metadata = Metadata::new();
    metadata.insert("k".repeat(100), "v".repeat(300));

    let encoded = encode_metadata(&metadata, CS);
    let decoded = decode_metadata(&encoded, CS);
    assert_eq!(decoded.len(), 1);
    let (key, value) = decoded.iter().next().unwrap();
    assert_eq!(key.len(), FDFS_MAX_META_NAME_LEN);
    assert_eq!(value.len(), FDFS_MAX_META_VALUE_LEN);
}

#[test]
fn latin1_fields_encode_one_byte_per_char() {
    let latin = Charset::Iso8859_1;
    let padded = pad_field("café", 8, latin);
    assert_eq!(&padded[..4], &[b'c', b'a', b'f', 0xE9]);
    assert_eq!(unpad_field(&padded, latin), "café");

    // the same text in utf-8 is five bytes
    assert_eq!(Charset::Utf8.encode("café").len(), 5);
}

#[test]
fn group_stat_record_length_matches_the_wire() {
    assert_eq!(FDFS_GROUP_STAT_LEN, 105);
    assert_eq!(FDFS_STORAGE_STAT_LEN, 342);
}
