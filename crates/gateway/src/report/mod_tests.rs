use super::*;

fn sample_list(device_id: DeviceId) -> SignedListReport {
    SignedListReport {
        device_id,
        report_id: 7,
        sent_timestamp: 123_456,
        flags: ReportFlags { encrypted: false, key_type: KeyType::Device },
        selector: 0x1000,
        readings: vec![
            Reading { stream_id: 0x1000, reading_id: 1, timestamp: 1000, value: 42 },
            Reading { stream_id: 0x1000, reading_id: 2, timestamp: 1005, value: 43 },
            Reading { stream_id: 0x1000, reading_id: 3, timestamp: 1010, value: 44 },
        ],
        lowest_reading_id: 1,
        highest_reading_id: 3,
        signature: [0u8; SIGNATURE_LEN],
    }
}

#[test]
fn individual_report_roundtrips() {
    let report = IndividualReport {
        stream_id: 0x2001,
        reading_id: 42,
        reading_timestamp: 1000,
        reading_value: 99,
        sent_timestamp: 2000,
    };
    let encoded = report.encode();
    assert_eq!(encoded.len(), INDIVIDUAL_LEN);
    let decoded = IndividualReport::decode(&encoded).unwrap();
    assert_eq!(decoded, report);
}

#[test]
fn individual_report_rejects_wrong_length() {
    assert!(IndividualReport::decode(&[0u8; 19]).is_err());
}

#[test]
fn signed_list_header_length_is_24bit_clean_split() {
    let header = SignedListHeader {
        magic: SIGNED_LIST_MAGIC,
        length: 0x00F1_2345,
        flags: ReportFlags { encrypted: true, key_type: KeyType::Broadcast },
        reading_count: 3,
        device_id: 0x10,
        report_id: 7,
        sent_timestamp: 55,
        selector: 0x1000,
    };
    let encoded = header.encode();
    let decoded = SignedListHeader::decode(&encoded).unwrap();
    assert_eq!(decoded.length, header.length);
    assert_eq!(decoded.flags, header.flags);
    assert_eq!(decoded.device_id, header.device_id);
}

#[test]
fn signed_list_report_roundtrips() {
    let report = sample_list(0x10);
    let encoded = report.encode();
    assert_eq!(encoded.len(), SignedListReport::wire_len(3));
    let decoded = SignedListReport::decode(&encoded).unwrap();
    assert_eq!(decoded, report);
}

#[test]
fn signed_list_rejects_decreasing_reading_ids() {
    let mut report = sample_list(0x10);
    report.readings[1].reading_id = 0; // now decreasing: 1, 0, 3
    let encoded = report.encode();
    assert!(SignedListReport::decode(&encoded).is_err());
}

#[test]
fn signed_list_rejects_length_mismatch() {
    let report = sample_list(0x10);
    let mut encoded = report.encode();
    encoded.push(0); // trailing garbage byte
    assert!(SignedListReport::decode(&encoded).is_err());
}

#[test]
fn report_flags_byte_roundtrips() {
    for key_type in [KeyType::None, KeyType::Device, KeyType::User, KeyType::Broadcast] {
        for encrypted in [true, false] {
            let flags = ReportFlags { encrypted, key_type };
            let byte = flags.to_byte();
            assert_eq!(ReportFlags::from_byte(byte), flags);
        }
    }
}
