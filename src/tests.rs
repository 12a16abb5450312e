//! End-to-end tests driving the stack against a scripted controller.

use embassy_futures::join::join;
use embassy_futures::select::{select, select3, Either};
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::att;
use crate::attribute::{
    AttributeValue, Characteristic, CharacteristicProp, Permission, Service, ServiceHandle,
};
use crate::connection::Connection;
use crate::gatt::client::GattClient;
use crate::gatt::{AttrDesc, GattHandler, GattServer, NoHandler};
use crate::hci::Opcode;
use crate::host::Adapter;
use crate::mock_transport::MockTransport;
use crate::store::Store;
use crate::types::ConnHandle;
use crate::{Error, Address};

pub(crate) type TestAdapter = Adapter<NoopRawMutex, MockTransport>;

fn adapter(mock: &MockTransport) -> TestAdapter {
    Adapter::new(mock.clone(), StdRng::seed_from_u64(0x42))
}

/// Drive [`Adapter::init`] while playing the controller side.
pub(crate) async fn init_stack(mock: &MockTransport, adapter: &TestAdapter, buffers: u8) {
    join(
        async {
            adapter.init().await.unwrap();
        },
        async {
            loop {
                let pkt = mock.host_packet().await;
                assert_eq!(pkt[0], 0x01, "expected a command packet");
                let opcode = Opcode(u16::from_le_bytes([pkt[1], pkt[2]]));
                let params: Vec<u8> = match opcode {
                    Opcode::LE_READ_BUFFER_SIZE => vec![0x00, 27, 0, buffers],
                    Opcode::READ_BD_ADDR => vec![0x00, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
                    Opcode::READ_LOCAL_VERSION => vec![0x00, 0x0C, 0x00, 0x00, 0x0C, 0x0F, 0x00, 0x34, 0x12],
                    _ => vec![0x00],
                };
                mock.controller_sends(&MockTransport::command_complete(opcode, &params))
                    .await;
                if opcode == Opcode::READ_LOCAL_VERSION {
                    break;
                }
            }
        },
    )
    .await;
}

pub(crate) async fn connect_peer<'a>(
    mock: &MockTransport,
    adapter: &'a TestAdapter,
    handle: u16,
    peer: [u8; 6],
) -> Connection<'a, NoopRawMutex, MockTransport> {
    let handle = ConnHandle::new(handle);
    mock.controller_sends(&MockTransport::le_connection_complete(handle, 1, peer))
        .await;
    loop {
        if let Some(index) = adapter.connections.lookup(handle) {
            let generation = adapter.connections.with_handle(handle, |s| s.generation).unwrap();
            return Connection::new(adapter, index, generation);
        }
        yield_now().await;
    }
}

/// Strip the ACL and L2CAP headers off a host packet.
pub(crate) fn att_from_acl(pkt: &[u8]) -> Vec<u8> {
    assert_eq!(pkt[0], 0x02, "expected an acl packet");
    let cid = u16::from_le_bytes([pkt[7], pkt[8]]);
    assert_eq!(cid, 0x0004);
    pkt[9..].to_vec()
}

fn battery_service() -> Service {
    Service::new(0x180Fu16).characteristic(
        Characteristic::new(0x2A19u16, [CharacteristicProp::Read, CharacteristicProp::Notify])
            .read_perm(Permission::Open)
            .max_len(2)
            .value(AttributeValue::Bytes(vec![100])),
    )
}

#[tokio::test]
async fn init_learns_buffer_geometry_and_address() {
    let mock = MockTransport::new();
    let adapter = adapter(&mock);
    let runner = adapter.runner();

    let main = async {
        init_stack(&mock, &adapter, 3).await;
        assert_eq!(adapter.acl_mtu(), 27);
        assert_eq!(
            adapter.own_address().unwrap(),
            Address::parse("00:11:22:33:44:55:66").unwrap()
        );
        assert_eq!(adapter.local_version().manufacturer, 0x000F);
    };
    let result = select(runner.run(), main).await;
    assert!(matches!(result, Either::Second(())));
}

#[tokio::test]
async fn credits_gate_acl_transmission() {
    let mock = MockTransport::new();
    let adapter = adapter(&mock);
    let runner = adapter.runner();

    let main = async {
        init_stack(&mock, &adapter, 3).await;
        let conn = connect_peer(&mock, &adapter, 0x0040, [1, 2, 3, 4, 5, 6]).await;

        // One PDU of 30 l2cap bytes: two fragments at acl mtu 27.
        let a = vec![0xAA; 26];
        conn.send(0x0004, &a).await.unwrap();
        let f1 = mock.host_packet().await;
        let f2 = mock.host_packet().await;
        // PB flags: first then continuing.
        assert_eq!(f1[2] >> 4, 0b00);
        assert_eq!(f2[2] >> 4, 0b01);
        assert_eq!(f1[1], 0x40);

        // Third credit consumed here; the next PDU must wait.
        let completion = conn.send(0x0004, &[0xBB; 4]).await.unwrap();
        let _f3 = mock.host_packet().await;

        let third = [0xCC; 4];
        let blocked = conn.send(0x0004, &third);
        join(
            async {
                let completion = blocked.await.unwrap();
                completion.completed().await.unwrap();
            },
            async {
                for _ in 0..20 {
                    yield_now().await;
                }
                assert!(mock.try_host_packet().is_none(), "no credits, nothing may be sent");
                // Over-reporting is clamped to the three actually held.
                mock.controller_sends(&MockTransport::completed_packets(ConnHandle::new(0x0040), 4))
                    .await;
                let f4 = mock.host_packet().await;
                assert_eq!(&f4[5..], &[4, 0, 4, 0, 0xCC, 0xCC, 0xCC, 0xCC]);
                mock.controller_sends(&MockTransport::completed_packets(ConnHandle::new(0x0040), 1))
                    .await;
            },
        )
        .await;
        completion.completed().await.unwrap();
    };
    let result = select(runner.run(), main).await;
    assert!(matches!(result, Either::Second(())));
}

#[tokio::test]
async fn server_answers_mtu_exchange_and_notifies_in_order() {
    let mock = MockTransport::new();
    let adapter = adapter(&mock);
    let runner = adapter.runner();
    let handle = ConnHandle::new(0x0040);

    let main = async {
        init_stack(&mock, &adapter, 64).await;
        let server = GattServer::new(&adapter, None).unwrap();
        let placed = server.add_services(vec![battery_service()]).unwrap();
        let battery = placed[0].characteristics[0];
        let conn = connect_peer(&mock, &adapter, 0x0040, [1, 2, 3, 4, 5, 6]).await;

        let mut handler = NoHandler;
        let serve = server.run(&mut handler);
        let body = async {
            // Subscribe to notifications.
            let cccd = battery.cccd.unwrap();
            let mut write = vec![att::ATT_WRITE_REQ];
            write.extend_from_slice(&cccd.to_le_bytes());
            write.extend_from_slice(&[0x01, 0x00]);
            mock.controller_sends(&MockTransport::acl_att(handle, &write)).await;
            assert_eq!(att_from_acl(&mock.host_packet().await), vec![att::ATT_WRITE_RSP]);

            // Three notifications, in order.
            for payload in [[0x01], [0x02], [0x03]] {
                server.notify(&conn, &battery, &payload).await.unwrap();
            }
            for expected in 1u8..=3 {
                let ntf = att_from_acl(&mock.host_packet().await);
                assert_eq!(ntf[0], att::ATT_HANDLE_VALUE_NTF);
                assert_eq!(u16::from_le_bytes([ntf[1], ntf[2]]), battery.value);
                assert_eq!(ntf[3], expected);
            }

            // Client-initiated MTU exchange: response carries our rx mtu,
            // the effective mtu is the minimum.
            mock.controller_sends(&MockTransport::acl_att(handle, &[att::ATT_EXCHANGE_MTU_REQ, 100, 0]))
                .await;
            let rsp = att_from_acl(&mock.host_packet().await);
            assert_eq!(rsp, vec![att::ATT_EXCHANGE_MTU_RSP, 0x05, 0x02]);
            assert_eq!(conn.att_mtu(), 100);

            // A second exchange cannot grow it further.
            mock.controller_sends(&MockTransport::acl_att(handle, &[att::ATT_EXCHANGE_MTU_REQ, 0xF4, 0x01]))
                .await;
            let rsp = att_from_acl(&mock.host_packet().await);
            assert_eq!(rsp, vec![att::ATT_EXCHANGE_MTU_RSP, 0x05, 0x02]);
            assert_eq!(conn.att_mtu(), 100);
        };
        match select(serve, body).await {
            Either::First(r) => panic!("server stopped: {r:?}"),
            Either::Second(()) => {}
        }
    };
    let result = select(runner.run(), main).await;
    assert!(matches!(result, Either::Second(())));
}

#[tokio::test]
async fn client_reads_long_values_with_blobs() {
    let mock = MockTransport::new();
    let adapter = adapter(&mock);
    let runner = adapter.runner();
    let handle = ConnHandle::new(0x0040);

    let main = async {
        init_stack(&mock, &adapter, 8).await;
        let conn = connect_peer(&mock, &adapter, 0x0040, [1, 2, 3, 4, 5, 6]).await;
        let client = GattClient::new(conn.clone(), None);

        let value: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let remote = async {
            loop {
                let pkt = mock.host_packet().await;
                mock.controller_sends(&MockTransport::completed_packets(handle, 1)).await;
                let req = att_from_acl(&pkt);
                let rsp: Vec<u8> = match req[0] {
                    att::ATT_READ_REQ => {
                        assert_eq!(u16::from_le_bytes([req[1], req[2]]), 0x0042);
                        let mut r = vec![att::ATT_READ_RSP];
                        r.extend_from_slice(&value[..22]);
                        r
                    }
                    att::ATT_READ_BLOB_REQ => {
                        let offset = u16::from_le_bytes([req[3], req[4]]) as usize;
                        let end = (offset + 22).min(value.len());
                        let mut r = vec![att::ATT_READ_BLOB_RSP];
                        r.extend_from_slice(&value[offset..end]);
                        r
                    }
                    other => panic!("unexpected request {other:02x}"),
                };
                mock.controller_sends(&MockTransport::acl_att(handle, &rsp)).await;
            }
        };

        let body = async {
            let read = client.read(0x0042).await.unwrap();
            assert_eq!(read.len(), 512);
            assert_eq!(&read[..], &value[..512]);
        };
        match select(remote, body).await {
            Either::First(()) => unreachable!(),
            Either::Second(()) => {}
        }
    };
    let result = select(runner.run(), main).await;
    assert!(matches!(result, Either::Second(())));
}

#[tokio::test]
async fn reliable_write_echo_mismatch_aborts_the_session() {
    let mock = MockTransport::new();
    let adapter = adapter(&mock);
    let runner = adapter.runner();
    let handle = ConnHandle::new(0x0040);

    let main = async {
        init_stack(&mock, &adapter, 8).await;
        let conn = connect_peer(&mock, &adapter, 0x0040, [1, 2, 3, 4, 5, 6]).await;
        let client = GattClient::new(conn.clone(), None);

        let remote = async {
            let mut prepares = 0;
            loop {
                let pkt = mock.host_packet().await;
                mock.controller_sends(&MockTransport::completed_packets(handle, 1)).await;
                let req = att_from_acl(&pkt);
                match req[0] {
                    att::ATT_PREPARE_WRITE_REQ => {
                        prepares += 1;
                        let mut rsp = req.clone();
                        rsp[0] = att::ATT_PREPARE_WRITE_RSP;
                        if prepares == 2 {
                            // Corrupt the echo.
                            let last = rsp.len() - 1;
                            rsp[last] ^= 0xFF;
                        }
                        mock.controller_sends(&MockTransport::acl_att(handle, &rsp)).await;
                    }
                    att::ATT_EXECUTE_WRITE_REQ => {
                        // The client must abort, not commit.
                        assert_eq!(req[1], 0x00);
                        mock.controller_sends(&MockTransport::acl_att(handle, &[att::ATT_EXECUTE_WRITE_RSP]))
                            .await;
                    }
                    other => panic!("unexpected request {other:02x}"),
                }
            }
        };

        let body = async {
            client.begin_reliable_write().unwrap();
            let value: Vec<u8> = (0..30).collect();
            let result = client.write(0x0050, &value).await;
            assert!(matches!(result, Err(Error::ReliableWriteAborted)));
            // The session is over; a new one may start.
            client.begin_reliable_write().unwrap();
        };
        match select(remote, body).await {
            Either::First(()) => unreachable!(),
            Either::Second(()) => {}
        }
    };
    let result = select(runner.run(), main).await;
    assert!(matches!(result, Either::Second(())));
}

#[derive(Default)]
struct RecordingHandler {
    subscriptions: Vec<(u16, bool, bool, bool)>,
}

impl GattHandler for RecordingHandler {
    fn subscription_changed(&mut self, attr: &AttrDesc<'_>, notifications: bool, indications: bool, from_write: bool) {
        self.subscriptions.push((attr.handle, notifications, indications, from_write));
    }
}

#[tokio::test]
async fn bonded_peer_cccd_survives_reconnect() {
    let root = std::env::temp_dir().join(format!("bluehost-e2e-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    let store = Store::new(&root);

    let mock = MockTransport::new();
    let adapter = adapter(&mock);
    let runner = adapter.runner();
    let peer_bytes = [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA];
    let handle = ConnHandle::new(0x0040);

    let main = async {
        init_stack(&mock, &adapter, 64).await;
        let server = GattServer::new(&adapter, Some(&store)).unwrap();
        let placed: Vec<ServiceHandle> = server.add_services(vec![battery_service()]).unwrap();
        let battery = placed[0].characteristics[0];
        let cccd = battery.cccd.unwrap();

        let conn = connect_peer(&mock, &adapter, 0x0040, peer_bytes).await;
        conn.set_bonded(true).unwrap();
        let peer = conn.peer_address().unwrap();
        let own = adapter.own_address().unwrap();

        let mut handler = RecordingHandler::default();
        let mut wire_handler = NoHandler;
        let serve = server.run(&mut wire_handler);
        let body = async {
            // Subscribe over the wire; the value must hit the store.
            let mut write = vec![att::ATT_WRITE_REQ];
            write.extend_from_slice(&cccd.to_le_bytes());
            write.extend_from_slice(&[0x01, 0x00]);
            mock.controller_sends(&MockTransport::acl_att(handle, &write)).await;
            assert_eq!(att_from_acl(&mock.host_packet().await), vec![att::ATT_WRITE_RSP]);
            assert_eq!(store.get_cccd(own, peer, cccd), Some(0x01));

            // Disconnect, then reconnect the same bonded peer.
            mock.controller_sends(&MockTransport::disconnection_complete(handle, 0x13))
                .await;
            while conn.is_connected() {
                yield_now().await;
            }
            server.connection_closed(handle, &mut handler);
            assert_eq!(handler.subscriptions, vec![(battery.value, false, false, false)]);
            handler.subscriptions.clear();
            drop(conn);

            let conn2 = connect_peer(&mock, &adapter, 0x0041, peer_bytes).await;
            conn2.set_bonded(true).unwrap();
            server.connection_opened(&conn2).unwrap();
            server.connection_ready(&conn2, &mut handler).unwrap();
            assert_eq!(handler.subscriptions, vec![(battery.value, true, false, false)]);

            // Notifications resume without a fresh subscription write.
            server.notify(&conn2, &battery, &[0x07]).await.unwrap();
            let ntf = att_from_acl(&mock.host_packet().await);
            assert_eq!(ntf, vec![att::ATT_HANDLE_VALUE_NTF, battery.value as u8, 0x00, 0x07]);
        };
        match select(serve, body).await {
            Either::First(r) => panic!("server stopped: {r:?}"),
            Either::Second(()) => {}
        }
    };
    let result = select(runner.run(), main).await;
    assert!(matches!(result, Either::Second(())));
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn client_discovers_what_the_server_placed() {
    let mock = MockTransport::new();
    let server_adapter = adapter(&mock);

    // Loop a client against our own server by scripting both sides of
    // the wire from the same attribute table.
    let peer_mock = MockTransport::new();
    let client_adapter = Adapter::<NoopRawMutex, _>::new(peer_mock.clone(), StdRng::seed_from_u64(7));

    let server_runner = server_adapter.runner();
    let client_runner = client_adapter.runner();
    let handle = ConnHandle::new(0x0040);

    let main = async {
        join(
            init_stack(&mock, &server_adapter, 64),
            init_stack(&peer_mock, &client_adapter, 64),
        )
        .await;
        let server = GattServer::new(&server_adapter, None).unwrap();
        let placed = server.add_services(vec![battery_service()]).unwrap();

        let server_conn = connect_peer(&mock, &server_adapter, 0x0040, [9, 9, 9, 9, 9, 9]).await;
        let client_conn = connect_peer(&peer_mock, &client_adapter, 0x0040, [8, 8, 8, 8, 8, 8]).await;
        let _ = server_conn;
        let client = GattClient::new(client_conn.clone(), None);

        let mut wire_handler = NoHandler;
        let serve = server.run(&mut wire_handler);
        // Shuttle ATT PDUs between the two adapters.
        let shuttle = async {
            loop {
                let either = select(peer_mock.host_packet(), mock.host_packet()).await;
                match either {
                    Either::First(pkt) => {
                        peer_mock
                            .controller_sends(&MockTransport::completed_packets(handle, 1))
                            .await;
                        mock.controller_sends(&MockTransport::acl(handle, pkt[2] >> 4 == 0b01, &pkt[5..]))
                            .await;
                    }
                    Either::Second(pkt) => {
                        mock.controller_sends(&MockTransport::completed_packets(handle, 1)).await;
                        peer_mock
                            .controller_sends(&MockTransport::acl(handle, pkt[2] >> 4 == 0b01, &pkt[5..]))
                            .await;
                    }
                }
            }
        };

        let body = async {
            let services = client.discover_all_primary_services().await.unwrap();
            // GATT + GAP + battery.
            assert_eq!(services.len(), 3);
            let battery = services
                .iter()
                .find(|s| s.uuid == crate::types::uuid::Uuid::new_short(0x180F))
                .unwrap();
            assert_eq!((battery.start, battery.end), (placed[0].start, placed[0].end));

            let chars = client.discover_characteristics(battery).await.unwrap();
            assert_eq!(chars.len(), 1);
            let c = &chars[0];
            assert_eq!(c.uuid, crate::types::uuid::Uuid::new_short(0x2A19));
            assert_eq!(c.value, placed[0].characteristics[0].value);
            assert!(c.props.any(&[CharacteristicProp::Notify]));

            let descriptors = client.discover_descriptors(c).await.unwrap();
            assert_eq!(descriptors.len(), 1);
            assert_eq!(descriptors[0].handle, placed[0].characteristics[0].cccd.unwrap());

            // Reading through the loop returns the stored value.
            let value = client.read(c.value).await.unwrap();
            assert_eq!(value, vec![100]);
        };

        match select3(serve, shuttle, body).await {
            embassy_futures::select::Either3::Third(()) => {}
            _ => panic!("ended early"),
        }
    };

    let result = select3(server_runner.run(), client_runner.run(), main).await;
    assert!(matches!(result, embassy_futures::select::Either3::Third(())));
}
