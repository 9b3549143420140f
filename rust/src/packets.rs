// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod hci {
    //! Status codes shared with the host, and the host-facing
    //! notifications raised by the controller core.

    use bytes::BufMut;
    use num_derive::FromPrimitive;

    /// Bluetooth Core, Vol 1, Part F, error codes.
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
    pub enum ErrorCode {
        Success = 0x00,
        UnknownConnection = 0x02,
        HardwareFailure = 0x03,
        ConnectionTimeout = 0x08,
        ConnectionLimitExceeded = 0x09,
        ConnectionAlreadyExists = 0x0b,
        CommandDisallowed = 0x0c,
        ConnectionRejectedLimitedResources = 0x0d,
        UnsupportedFeatureOrParameterValue = 0x11,
        InvalidHciCommandParameters = 0x12,
        RemoteUserTerminatedConnection = 0x13,
        ConnectionTerminatedByLocalHost = 0x16,
        UnsupportedRemoteFeature = 0x1a,
        InvalidLlParameters = 0x1e,
        UnspecifiedError = 0x1f,
        LlResponseTimeout = 0x22,
        LlProcedureCollision = 0x23,
        InstantPassed = 0x28,
        DifferentTransactionCollision = 0x2a,
        CisFailedToBeEstablished = 0x3e,
    }

    impl ErrorCode {
        pub fn from_u8(value: u8) -> ErrorCode {
            num_traits::FromPrimitive::from_u8(value).unwrap_or(ErrorCode::UnspecifiedError)
        }
    }

    impl From<ErrorCode> for u8 {
        fn from(code: ErrorCode) -> u8 {
            code as u8
        }
    }

    /// Link layer role. Central is the initiator of the ACL
    /// connection (master), Peripheral the advertiser (slave).
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    pub enum Role {
        Central = 0,
        Peripheral = 1,
    }

    /// Channel selection algorithm in use on a connection.
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    pub enum ChanSel {
        Csa1 = 0,
        Csa2 = 1,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct CisEstablishedParams {
        pub cig_sync_delay: u32,
        pub cis_sync_delay: u32,
        pub transport_latency_c_to_p: u32,
        pub transport_latency_p_to_c: u32,
        pub phy_c_to_p: u8,
        pub phy_p_to_c: u8,
        pub nse: u8,
        pub bn_c_to_p: u8,
        pub bn_p_to_c: u8,
        pub ft_c_to_p: u8,
        pub ft_p_to_c: u8,
        pub max_pdu_c_to_p: u16,
        pub max_pdu_p_to_c: u16,
        pub iso_interval: u16,
    }

    /// Notifications sent upward to the host.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum HostEvent {
        HardwareError {
            code: u8,
        },
        ConnectionComplete {
            status: ErrorCode,
            handle: u16,
            role: Role,
            peer_address_type: u8,
            peer_address: [u8; 6],
            interval: u16,
            latency: u16,
            supervision_timeout: u16,
            central_clock_accuracy: u8,
        },
        ChannelSelectionAlgorithm {
            handle: u16,
            algorithm: ChanSel,
        },
        DisconnectionComplete {
            status: ErrorCode,
            handle: u16,
            reason: ErrorCode,
        },
        ReadRemoteFeaturesComplete {
            status: ErrorCode,
            handle: u16,
            features: u64,
        },
        ReadRemoteVersionComplete {
            status: ErrorCode,
            handle: u16,
            version: u8,
            company_id: u16,
            sub_version: u16,
        },
        DataLengthChange {
            handle: u16,
            max_tx_octets: u16,
            max_tx_time: u16,
            max_rx_octets: u16,
            max_rx_time: u16,
        },
        RequestPeerScaComplete {
            status: ErrorCode,
            handle: u16,
            peer_sca: u8,
        },
        ConnectionUpdateComplete {
            status: ErrorCode,
            handle: u16,
            interval: u16,
            latency: u16,
            supervision_timeout: u16,
        },
        PhyUpdateComplete {
            status: ErrorCode,
            handle: u16,
            tx_phy: u8,
            rx_phy: u8,
        },
        CisRequest {
            acl_handle: u16,
            cis_handle: u16,
            cig_id: u8,
            cis_id: u8,
        },
        CisEstablished {
            status: ErrorCode,
            cis_handle: u16,
            params: Option<CisEstablishedParams>,
        },
        NumberOfCompletedPackets {
            handle: u16,
            count: u16,
        },
    }

    const DISCONNECTION_COMPLETE: u8 = 0x05;
    const READ_REMOTE_VERSION_COMPLETE: u8 = 0x0c;
    const HARDWARE_ERROR: u8 = 0x10;
    const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
    const LE_META_EVENT: u8 = 0x3e;

    #[repr(u8)]
    enum LeSubevent {
        ConnectionComplete = 0x01,
        ConnectionUpdateComplete = 0x03,
        ReadRemoteFeaturesComplete = 0x04,
        DataLengthChange = 0x07,
        PhyUpdateComplete = 0x0c,
        ChannelSelectionAlgorithm = 0x14,
        CisEstablished = 0x19,
        CisRequest = 0x1a,
        RequestPeerScaComplete = 0x1e,
    }

    impl HostEvent {
        /// Serialize to an HCI event packet (event code, parameter
        /// length, parameters).
        pub fn to_vec(&self) -> Vec<u8> {
            let mut params: Vec<u8> = Vec::with_capacity(32);
            let code = match self {
                HostEvent::HardwareError { code } => {
                    params.put_u8(*code);
                    HARDWARE_ERROR
                }
                HostEvent::DisconnectionComplete { status, handle, reason } => {
                    params.put_u8(*status as u8);
                    params.put_u16_le(*handle);
                    params.put_u8(*reason as u8);
                    DISCONNECTION_COMPLETE
                }
                HostEvent::ReadRemoteVersionComplete {
                    status,
                    handle,
                    version,
                    company_id,
                    sub_version,
                } => {
                    params.put_u8(*status as u8);
                    params.put_u16_le(*handle);
                    params.put_u8(*version);
                    params.put_u16_le(*company_id);
                    params.put_u16_le(*sub_version);
                    READ_REMOTE_VERSION_COMPLETE
                }
                HostEvent::NumberOfCompletedPackets { handle, count } => {
                    params.put_u8(1);
                    params.put_u16_le(*handle);
                    params.put_u16_le(*count);
                    NUMBER_OF_COMPLETED_PACKETS
                }
                HostEvent::ConnectionComplete {
                    status,
                    handle,
                    role,
                    peer_address_type,
                    peer_address,
                    interval,
                    latency,
                    supervision_timeout,
                    central_clock_accuracy,
                } => {
                    params.put_u8(LeSubevent::ConnectionComplete as u8);
                    params.put_u8(*status as u8);
                    params.put_u16_le(*handle);
                    params.put_u8(*role as u8);
                    params.put_u8(*peer_address_type);
                    params.put_slice(peer_address);
                    params.put_u16_le(*interval);
                    params.put_u16_le(*latency);
                    params.put_u16_le(*supervision_timeout);
                    params.put_u8(*central_clock_accuracy);
                    LE_META_EVENT
                }
                HostEvent::ConnectionUpdateComplete {
                    status,
                    handle,
                    interval,
                    latency,
                    supervision_timeout,
                } => {
                    params.put_u8(LeSubevent::ConnectionUpdateComplete as u8);
                    params.put_u8(*status as u8);
                    params.put_u16_le(*handle);
                    params.put_u16_le(*interval);
                    params.put_u16_le(*latency);
                    params.put_u16_le(*supervision_timeout);
                    LE_META_EVENT
                }
                HostEvent::ReadRemoteFeaturesComplete { status, handle, features } => {
                    params.put_u8(LeSubevent::ReadRemoteFeaturesComplete as u8);
                    params.put_u8(*status as u8);
                    params.put_u16_le(*handle);
                    params.put_u64_le(*features);
                    LE_META_EVENT
                }
                HostEvent::DataLengthChange {
                    handle,
                    max_tx_octets,
                    max_tx_time,
                    max_rx_octets,
                    max_rx_time,
                } => {
                    params.put_u8(LeSubevent::DataLengthChange as u8);
                    params.put_u16_le(*handle);
                    params.put_u16_le(*max_tx_octets);
                    params.put_u16_le(*max_tx_time);
                    params.put_u16_le(*max_rx_octets);
                    params.put_u16_le(*max_rx_time);
                    LE_META_EVENT
                }
                HostEvent::PhyUpdateComplete { status, handle, tx_phy, rx_phy } => {
                    params.put_u8(LeSubevent::PhyUpdateComplete as u8);
                    params.put_u8(*status as u8);
                    params.put_u16_le(*handle);
                    params.put_u8(*tx_phy);
                    params.put_u8(*rx_phy);
                    LE_META_EVENT
                }
                HostEvent::ChannelSelectionAlgorithm { handle, algorithm } => {
                    params.put_u8(LeSubevent::ChannelSelectionAlgorithm as u8);
                    params.put_u16_le(*handle);
                    params.put_u8(*algorithm as u8);
                    LE_META_EVENT
                }
                HostEvent::CisEstablished { status, cis_handle, params: cis } => {
                    params.put_u8(LeSubevent::CisEstablished as u8);
                    params.put_u8(*status as u8);
                    params.put_u16_le(*cis_handle);
                    match cis {
                        Some(cis) => {
                            params.put_uint_le(cis.cig_sync_delay as u64, 3);
                            params.put_uint_le(cis.cis_sync_delay as u64, 3);
                            params.put_uint_le(cis.transport_latency_c_to_p as u64, 3);
                            params.put_uint_le(cis.transport_latency_p_to_c as u64, 3);
                            params.put_u8(cis.phy_c_to_p);
                            params.put_u8(cis.phy_p_to_c);
                            params.put_u8(cis.nse);
                            params.put_u8(cis.bn_c_to_p);
                            params.put_u8(cis.bn_p_to_c);
                            params.put_u8(cis.ft_c_to_p);
                            params.put_u8(cis.ft_p_to_c);
                            params.put_u16_le(cis.max_pdu_c_to_p);
                            params.put_u16_le(cis.max_pdu_p_to_c);
                            params.put_u16_le(cis.iso_interval);
                        }
                        None => params.put_bytes(0, 25),
                    }
                    LE_META_EVENT
                }
                HostEvent::CisRequest { acl_handle, cis_handle, cig_id, cis_id } => {
                    params.put_u8(LeSubevent::CisRequest as u8);
                    params.put_u16_le(*acl_handle);
                    params.put_u16_le(*cis_handle);
                    params.put_u8(*cig_id);
                    params.put_u8(*cis_id);
                    LE_META_EVENT
                }
                HostEvent::RequestPeerScaComplete { status, handle, peer_sca } => {
                    params.put_u8(LeSubevent::RequestPeerScaComplete as u8);
                    params.put_u8(*status as u8);
                    params.put_u16_le(*handle);
                    params.put_u8(*peer_sca);
                    LE_META_EVENT
                }
            };

            let mut packet = Vec::with_capacity(params.len() + 2);
            packet.put_u8(code);
            packet.put_u8(params.len() as u8);
            packet.extend_from_slice(&params);
            packet
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn test_cis_established_length() {
            let event = HostEvent::CisEstablished {
                status: ErrorCode::CisFailedToBeEstablished,
                cis_handle: 0xe00,
                params: None,
            };
            let bytes = event.to_vec();
            assert_eq!(bytes[0], LE_META_EVENT);
            assert_eq!(bytes[1] as usize, bytes.len() - 2);
            assert_eq!(bytes.len(), 2 + 29);
        }

        #[test]
        fn test_disconnection_complete() {
            let event = HostEvent::DisconnectionComplete {
                status: ErrorCode::Success,
                handle: 0x0102,
                reason: ErrorCode::RemoteUserTerminatedConnection,
            };
            assert_eq!(event.to_vec(), vec![0x05, 4, 0x00, 0x02, 0x01, 0x13]);
        }
    }
}

pub mod llcp {
    //! Link Layer control PDUs, Bluetooth Core Vol 6, Part B, 2.4.2.

    use bytes::{Buf, BufMut};
    use num_derive::FromPrimitive;
    use thiserror::Error;

    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
    pub enum Opcode {
        ConnectionUpdateInd = 0x00,
        ChannelMapInd = 0x01,
        TerminateInd = 0x02,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        VersionInd = 0x0c,
        RejectInd = 0x0d,
        PeripheralFeatureReq = 0x0e,
        RejectExtInd = 0x11,
        LengthReq = 0x14,
        LengthRsp = 0x15,
        PhyReq = 0x16,
        PhyRsp = 0x17,
        PhyUpdateInd = 0x18,
        ClockAccuracyReq = 0x1d,
        ClockAccuracyRsp = 0x1e,
        CisReq = 0x1f,
        CisRsp = 0x20,
        CisInd = 0x21,
        CisTerminateInd = 0x22,
    }

    impl Opcode {
        /// Size of the CtrData field.
        fn ctr_data_len(self) -> usize {
            match self {
                Opcode::ConnectionUpdateInd => 11,
                Opcode::ChannelMapInd => 7,
                Opcode::TerminateInd => 1,
                Opcode::UnknownRsp => 1,
                Opcode::FeatureReq | Opcode::FeatureRsp | Opcode::PeripheralFeatureReq => 8,
                Opcode::VersionInd => 5,
                Opcode::RejectInd => 1,
                Opcode::RejectExtInd => 2,
                Opcode::LengthReq | Opcode::LengthRsp => 8,
                Opcode::PhyReq | Opcode::PhyRsp => 2,
                Opcode::PhyUpdateInd => 4,
                Opcode::ClockAccuracyReq | Opcode::ClockAccuracyRsp => 1,
                Opcode::CisReq => 35,
                Opcode::CisRsp => 8,
                Opcode::CisInd => 15,
                Opcode::CisTerminateInd => 3,
            }
        }
    }

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum PacketError {
        #[error("Empty LLCP packet")]
        Empty,
        #[error("Unknown LLCP opcode 0x{0:02x}")]
        UnknownOpcode(u8),
        #[error("Invalid length for {opcode:?}: expected {expected}, got {actual}")]
        InvalidLength { opcode: Opcode, expected: usize, actual: usize },
        #[error("Invalid field {field} in {opcode:?}")]
        InvalidField { opcode: Opcode, field: &'static str },
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct CisReq {
        pub cig_id: u8,
        pub cis_id: u8,
        pub phy_c_to_p: u8,
        pub phy_p_to_c: u8,
        pub framed: bool,
        pub max_sdu_c_to_p: u16,
        pub max_sdu_p_to_c: u16,
        pub sdu_interval_c_to_p: u32,
        pub sdu_interval_p_to_c: u32,
        pub max_pdu_c_to_p: u16,
        pub max_pdu_p_to_c: u16,
        pub nse: u8,
        pub sub_interval: u32,
        pub bn_c_to_p: u8,
        pub bn_p_to_c: u8,
        pub ft_c_to_p: u8,
        pub ft_p_to_c: u8,
        pub iso_interval: u16,
        pub cis_offset_min: u32,
        pub cis_offset_max: u32,
        pub conn_event_count: u16,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct CisRsp {
        pub cis_offset_min: u32,
        pub cis_offset_max: u32,
        pub conn_event_count: u16,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct CisInd {
        pub access_address: u32,
        pub cis_offset: u32,
        pub cig_sync_delay: u32,
        pub cis_sync_delay: u32,
        pub conn_event_count: u16,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct ConnectionUpdateInd {
        pub win_size: u8,
        pub win_offset: u16,
        pub interval: u16,
        pub latency: u16,
        pub timeout: u16,
        pub instant: u16,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct DataLength {
        pub max_rx_octets: u16,
        pub max_rx_time: u16,
        pub max_tx_octets: u16,
        pub max_tx_time: u16,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum LlcpPdu {
        ConnectionUpdateInd(ConnectionUpdateInd),
        ChannelMapInd { channel_map: u64, instant: u16 },
        TerminateInd { error_code: u8 },
        UnknownRsp { unknown_type: u8 },
        FeatureReq { features: u64 },
        FeatureRsp { features: u64 },
        PeripheralFeatureReq { features: u64 },
        VersionInd { version: u8, company_id: u16, sub_version: u16 },
        RejectInd { error_code: u8 },
        RejectExtInd { reject_opcode: u8, error_code: u8 },
        LengthReq(DataLength),
        LengthRsp(DataLength),
        PhyReq { tx_phys: u8, rx_phys: u8 },
        PhyRsp { tx_phys: u8, rx_phys: u8 },
        PhyUpdateInd { phy_c_to_p: u8, phy_p_to_c: u8, instant: u16 },
        ClockAccuracyReq { sca: u8 },
        ClockAccuracyRsp { sca: u8 },
        CisReq(CisReq),
        CisRsp(CisRsp),
        CisInd(CisInd),
        CisTerminateInd { cig_id: u8, cis_id: u8, error_code: u8 },
    }

    fn valid_cis_phy(phy: u8) -> bool {
        matches!(phy, 0x1 | 0x2 | 0x4)
    }

    impl LlcpPdu {
        pub fn opcode(&self) -> Opcode {
            match self {
                LlcpPdu::ConnectionUpdateInd(_) => Opcode::ConnectionUpdateInd,
                LlcpPdu::ChannelMapInd { .. } => Opcode::ChannelMapInd,
                LlcpPdu::TerminateInd { .. } => Opcode::TerminateInd,
                LlcpPdu::UnknownRsp { .. } => Opcode::UnknownRsp,
                LlcpPdu::FeatureReq { .. } => Opcode::FeatureReq,
                LlcpPdu::FeatureRsp { .. } => Opcode::FeatureRsp,
                LlcpPdu::PeripheralFeatureReq { .. } => Opcode::PeripheralFeatureReq,
                LlcpPdu::VersionInd { .. } => Opcode::VersionInd,
                LlcpPdu::RejectInd { .. } => Opcode::RejectInd,
                LlcpPdu::RejectExtInd { .. } => Opcode::RejectExtInd,
                LlcpPdu::LengthReq(_) => Opcode::LengthReq,
                LlcpPdu::LengthRsp(_) => Opcode::LengthRsp,
                LlcpPdu::PhyReq { .. } => Opcode::PhyReq,
                LlcpPdu::PhyRsp { .. } => Opcode::PhyRsp,
                LlcpPdu::PhyUpdateInd { .. } => Opcode::PhyUpdateInd,
                LlcpPdu::ClockAccuracyReq { .. } => Opcode::ClockAccuracyReq,
                LlcpPdu::ClockAccuracyRsp { .. } => Opcode::ClockAccuracyRsp,
                LlcpPdu::CisReq(_) => Opcode::CisReq,
                LlcpPdu::CisRsp(_) => Opcode::CisRsp,
                LlcpPdu::CisInd(_) => Opcode::CisInd,
                LlcpPdu::CisTerminateInd { .. } => Opcode::CisTerminateInd,
            }
        }

        /// Parse an LL Control PDU payload (opcode followed by CtrData).
        pub fn parse(data: &[u8]) -> Result<LlcpPdu, PacketError> {
            let (&raw_opcode, mut buf) = data.split_first().ok_or(PacketError::Empty)?;
            let opcode: Opcode = num_traits::FromPrimitive::from_u8(raw_opcode)
                .ok_or(PacketError::UnknownOpcode(raw_opcode))?;

            // Extra trailing octets are tolerated for forward compatibility.
            if buf.len() < opcode.ctr_data_len() {
                return Err(PacketError::InvalidLength {
                    opcode,
                    expected: opcode.ctr_data_len(),
                    actual: buf.len(),
                });
            }

            let invalid = |field| PacketError::InvalidField { opcode, field };

            Ok(match opcode {
                Opcode::ConnectionUpdateInd => {
                    LlcpPdu::ConnectionUpdateInd(ConnectionUpdateInd {
                        win_size: buf.get_u8(),
                        win_offset: buf.get_u16_le(),
                        interval: buf.get_u16_le(),
                        latency: buf.get_u16_le(),
                        timeout: buf.get_u16_le(),
                        instant: buf.get_u16_le(),
                    })
                }
                Opcode::ChannelMapInd => LlcpPdu::ChannelMapInd {
                    channel_map: buf.get_uint_le(5) & 0x1f_ffff_ffff,
                    instant: buf.get_u16_le(),
                },
                Opcode::TerminateInd => LlcpPdu::TerminateInd { error_code: buf.get_u8() },
                Opcode::UnknownRsp => LlcpPdu::UnknownRsp { unknown_type: buf.get_u8() },
                Opcode::FeatureReq => LlcpPdu::FeatureReq { features: buf.get_u64_le() },
                Opcode::FeatureRsp => LlcpPdu::FeatureRsp { features: buf.get_u64_le() },
                Opcode::PeripheralFeatureReq => {
                    LlcpPdu::PeripheralFeatureReq { features: buf.get_u64_le() }
                }
                Opcode::VersionInd => LlcpPdu::VersionInd {
                    version: buf.get_u8(),
                    company_id: buf.get_u16_le(),
                    sub_version: buf.get_u16_le(),
                },
                Opcode::RejectInd => LlcpPdu::RejectInd { error_code: buf.get_u8() },
                Opcode::RejectExtInd => LlcpPdu::RejectExtInd {
                    reject_opcode: buf.get_u8(),
                    error_code: buf.get_u8(),
                },
                Opcode::LengthReq | Opcode::LengthRsp => {
                    let length = DataLength {
                        max_rx_octets: buf.get_u16_le(),
                        max_rx_time: buf.get_u16_le(),
                        max_tx_octets: buf.get_u16_le(),
                        max_tx_time: buf.get_u16_le(),
                    };
                    if length.max_rx_octets < 27 || length.max_tx_octets < 27 {
                        return Err(invalid("max_octets"));
                    }
                    if opcode == Opcode::LengthReq {
                        LlcpPdu::LengthReq(length)
                    } else {
                        LlcpPdu::LengthRsp(length)
                    }
                }
                Opcode::PhyReq => LlcpPdu::PhyReq { tx_phys: buf.get_u8(), rx_phys: buf.get_u8() },
                Opcode::PhyRsp => LlcpPdu::PhyRsp { tx_phys: buf.get_u8(), rx_phys: buf.get_u8() },
                Opcode::PhyUpdateInd => LlcpPdu::PhyUpdateInd {
                    phy_c_to_p: buf.get_u8(),
                    phy_p_to_c: buf.get_u8(),
                    instant: buf.get_u16_le(),
                },
                Opcode::ClockAccuracyReq => LlcpPdu::ClockAccuracyReq { sca: buf.get_u8() & 0x7 },
                Opcode::ClockAccuracyRsp => LlcpPdu::ClockAccuracyRsp { sca: buf.get_u8() & 0x7 },
                Opcode::CisReq => {
                    let cig_id = buf.get_u8();
                    let cis_id = buf.get_u8();
                    let phy_c_to_p = buf.get_u8();
                    let phy_p_to_c = buf.get_u8();
                    let max_sdu_c_to_p = buf.get_u16_le();
                    let max_sdu_p_to_c = buf.get_u16_le();
                    let sdu_interval_c_to_p = buf.get_uint_le(3) as u32;
                    let sdu_interval_p_to_c = buf.get_uint_le(3) as u32;
                    let max_pdu_c_to_p = buf.get_u16_le();
                    let max_pdu_p_to_c = buf.get_u16_le();
                    let nse = buf.get_u8();
                    let sub_interval = buf.get_uint_le(3) as u32;
                    let bn = buf.get_u8();
                    let req = CisReq {
                        cig_id,
                        cis_id,
                        phy_c_to_p,
                        phy_p_to_c,
                        framed: (max_sdu_c_to_p & 0x8000) != 0,
                        max_sdu_c_to_p: max_sdu_c_to_p & 0x0fff,
                        max_sdu_p_to_c: max_sdu_p_to_c & 0x0fff,
                        sdu_interval_c_to_p: sdu_interval_c_to_p & 0x0f_ffff,
                        sdu_interval_p_to_c: sdu_interval_p_to_c & 0x0f_ffff,
                        max_pdu_c_to_p,
                        max_pdu_p_to_c,
                        nse,
                        sub_interval,
                        bn_c_to_p: bn & 0x0f,
                        bn_p_to_c: bn >> 4,
                        ft_c_to_p: buf.get_u8(),
                        ft_p_to_c: buf.get_u8(),
                        iso_interval: buf.get_u16_le(),
                        cis_offset_min: buf.get_uint_le(3) as u32,
                        cis_offset_max: buf.get_uint_le(3) as u32,
                        conn_event_count: buf.get_u16_le(),
                    };
                    if !valid_cis_phy(req.phy_c_to_p) || !valid_cis_phy(req.phy_p_to_c) {
                        return Err(invalid("phy"));
                    }
                    if req.nse == 0 || req.nse > 0x1f {
                        return Err(invalid("nse"));
                    }
                    if req.bn_c_to_p > req.nse || req.bn_p_to_c > req.nse {
                        return Err(invalid("bn"));
                    }
                    if !(0x4..=0xc80).contains(&req.iso_interval) {
                        return Err(invalid("iso_interval"));
                    }
                    if req.cis_offset_min > req.cis_offset_max {
                        return Err(invalid("cis_offset"));
                    }
                    LlcpPdu::CisReq(req)
                }
                Opcode::CisRsp => LlcpPdu::CisRsp(CisRsp {
                    cis_offset_min: buf.get_uint_le(3) as u32,
                    cis_offset_max: buf.get_uint_le(3) as u32,
                    conn_event_count: buf.get_u16_le(),
                }),
                Opcode::CisInd => LlcpPdu::CisInd(CisInd {
                    access_address: buf.get_u32_le(),
                    cis_offset: buf.get_uint_le(3) as u32,
                    cig_sync_delay: buf.get_uint_le(3) as u32,
                    cis_sync_delay: buf.get_uint_le(3) as u32,
                    conn_event_count: buf.get_u16_le(),
                }),
                Opcode::CisTerminateInd => LlcpPdu::CisTerminateInd {
                    cig_id: buf.get_u8(),
                    cis_id: buf.get_u8(),
                    error_code: buf.get_u8(),
                },
            })
        }

        pub fn to_vec(&self) -> Vec<u8> {
            let opcode = self.opcode();
            let mut out: Vec<u8> = Vec::with_capacity(1 + opcode.ctr_data_len());
            out.put_u8(opcode as u8);
            match self {
                LlcpPdu::ConnectionUpdateInd(ind) => {
                    out.put_u8(ind.win_size);
                    out.put_u16_le(ind.win_offset);
                    out.put_u16_le(ind.interval);
                    out.put_u16_le(ind.latency);
                    out.put_u16_le(ind.timeout);
                    out.put_u16_le(ind.instant);
                }
                LlcpPdu::ChannelMapInd { channel_map, instant } => {
                    out.put_uint_le(*channel_map & 0x1f_ffff_ffff, 5);
                    out.put_u16_le(*instant);
                }
                LlcpPdu::TerminateInd { error_code } | LlcpPdu::RejectInd { error_code } => {
                    out.put_u8(*error_code)
                }
                LlcpPdu::UnknownRsp { unknown_type } => out.put_u8(*unknown_type),
                LlcpPdu::FeatureReq { features }
                | LlcpPdu::FeatureRsp { features }
                | LlcpPdu::PeripheralFeatureReq { features } => out.put_u64_le(*features),
                LlcpPdu::VersionInd { version, company_id, sub_version } => {
                    out.put_u8(*version);
                    out.put_u16_le(*company_id);
                    out.put_u16_le(*sub_version);
                }
                LlcpPdu::RejectExtInd { reject_opcode, error_code } => {
                    out.put_u8(*reject_opcode);
                    out.put_u8(*error_code);
                }
                LlcpPdu::LengthReq(length) | LlcpPdu::LengthRsp(length) => {
                    out.put_u16_le(length.max_rx_octets);
                    out.put_u16_le(length.max_rx_time);
                    out.put_u16_le(length.max_tx_octets);
                    out.put_u16_le(length.max_tx_time);
                }
                LlcpPdu::PhyReq { tx_phys, rx_phys } | LlcpPdu::PhyRsp { tx_phys, rx_phys } => {
                    out.put_u8(*tx_phys);
                    out.put_u8(*rx_phys);
                }
                LlcpPdu::PhyUpdateInd { phy_c_to_p, phy_p_to_c, instant } => {
                    out.put_u8(*phy_c_to_p);
                    out.put_u8(*phy_p_to_c);
                    out.put_u16_le(*instant);
                }
                LlcpPdu::ClockAccuracyReq { sca } | LlcpPdu::ClockAccuracyRsp { sca } => {
                    out.put_u8(*sca & 0x7)
                }
                LlcpPdu::CisReq(req) => {
                    out.put_u8(req.cig_id);
                    out.put_u8(req.cis_id);
                    out.put_u8(req.phy_c_to_p);
                    out.put_u8(req.phy_p_to_c);
                    out.put_u16_le((req.max_sdu_c_to_p & 0x0fff) | ((req.framed as u16) << 15));
                    out.put_u16_le(req.max_sdu_p_to_c & 0x0fff);
                    out.put_uint_le((req.sdu_interval_c_to_p & 0x0f_ffff) as u64, 3);
                    out.put_uint_le((req.sdu_interval_p_to_c & 0x0f_ffff) as u64, 3);
                    out.put_u16_le(req.max_pdu_c_to_p);
                    out.put_u16_le(req.max_pdu_p_to_c);
                    out.put_u8(req.nse);
                    out.put_uint_le(req.sub_interval as u64, 3);
                    out.put_u8((req.bn_c_to_p & 0x0f) | (req.bn_p_to_c << 4));
                    out.put_u8(req.ft_c_to_p);
                    out.put_u8(req.ft_p_to_c);
                    out.put_u16_le(req.iso_interval);
                    out.put_uint_le(req.cis_offset_min as u64, 3);
                    out.put_uint_le(req.cis_offset_max as u64, 3);
                    out.put_u16_le(req.conn_event_count);
                }
                LlcpPdu::CisRsp(rsp) => {
                    out.put_uint_le(rsp.cis_offset_min as u64, 3);
                    out.put_uint_le(rsp.cis_offset_max as u64, 3);
                    out.put_u16_le(rsp.conn_event_count);
                }
                LlcpPdu::CisInd(ind) => {
                    out.put_u32_le(ind.access_address);
                    out.put_uint_le(ind.cis_offset as u64, 3);
                    out.put_uint_le(ind.cig_sync_delay as u64, 3);
                    out.put_uint_le(ind.cis_sync_delay as u64, 3);
                    out.put_u16_le(ind.conn_event_count);
                }
                LlcpPdu::CisTerminateInd { cig_id, cis_id, error_code } => {
                    out.put_u8(*cig_id);
                    out.put_u8(*cis_id);
                    out.put_u8(*error_code);
                }
            }
            out
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        fn cis_req() -> CisReq {
            CisReq {
                cig_id: 1,
                cis_id: 0,
                phy_c_to_p: 0x2,
                phy_p_to_c: 0x2,
                framed: true,
                max_sdu_c_to_p: 120,
                max_sdu_p_to_c: 60,
                sdu_interval_c_to_p: 10_000,
                sdu_interval_p_to_c: 10_000,
                max_pdu_c_to_p: 120,
                max_pdu_p_to_c: 60,
                nse: 4,
                sub_interval: 2_500,
                bn_c_to_p: 2,
                bn_p_to_c: 1,
                ft_c_to_p: 2,
                ft_p_to_c: 1,
                iso_interval: 8,
                cis_offset_min: 500,
                cis_offset_max: 4_000,
                conn_event_count: 17,
            }
        }

        #[test]
        fn test_cis_req_layout() {
            let bytes = LlcpPdu::CisReq(cis_req()).to_vec();
            assert_eq!(bytes.len(), 36);
            assert_eq!(bytes[0], Opcode::CisReq as u8);
            // Framed flag rides in the top bit of Max_SDU_C_To_P.
            assert_eq!(bytes[6], 0x80);
            // BN_P_To_C occupies the upper nibble.
            assert_eq!(bytes[23], 0x12);
            assert_eq!(LlcpPdu::parse(&bytes), Ok(LlcpPdu::CisReq(cis_req())));
        }

        #[test]
        fn test_cis_req_invalid_nse() {
            let mut bytes = LlcpPdu::CisReq(cis_req()).to_vec();
            bytes[19] = 0;
            assert_eq!(
                LlcpPdu::parse(&bytes),
                Err(PacketError::InvalidField { opcode: Opcode::CisReq, field: "nse" })
            );
        }

        #[test]
        fn test_short_packet() {
            assert_eq!(
                LlcpPdu::parse(&[Opcode::CisRsp as u8, 0, 0]),
                Err(PacketError::InvalidLength { opcode: Opcode::CisRsp, expected: 8, actual: 2 })
            );
            assert_eq!(LlcpPdu::parse(&[]), Err(PacketError::Empty));
            assert_eq!(LlcpPdu::parse(&[0x12]), Err(PacketError::UnknownOpcode(0x12)));
        }

        #[test]
        fn test_channel_map_ind() {
            let pdu = LlcpPdu::ChannelMapInd { channel_map: 0x1f_0000_00ff, instant: 0x1234 };
            let bytes = pdu.to_vec();
            assert_eq!(bytes, vec![0x01, 0xff, 0x00, 0x00, 0x00, 0x1f, 0x34, 0x12]);
            assert_eq!(LlcpPdu::parse(&bytes), Ok(pdu));
        }
    }
}
