//! Routine templates for the CYW20735 evaluation board.
//!
//! ROM symbol addresses come from the firmware symbol dump of the board.

/// Harvesting routine, entered through the redirected launch-RAM handler.
///
/// Parameters: `${rounds}` records per execution, `${dst}` result buffer,
/// `${sentinel}` trailing byte per record, `${marker}` event tag as a
/// little-endian word.
pub const CYW20735_HARVEST: &str = r#"
    push {r0-r7, lr}

    // the launch-RAM handler we displaced acknowledged the command itself
    movw r0, #0xfc4e
    movs r1, #0
    bl   0x24e66                // bthci_event_SendCommandCompleteEventWithStatus

    ldr  r0, =${rounds}
    ldr  r1, =${dst}
    bl   dump_rng
    bl   notify_hci
    pop  {r0-r7, pc}

dump_rng:
wait_ready:
    ldr  r2, =0x352604          // rbg_status
    ldr  r2, [r2]
    ldr  r3, =0x200fffff
    cmp  r2, r3
    bne  wait_ready

    movs r3, #1
    ldr  r2, =0x352600          // rbg_control
    str  r3, [r2]

    ldr  r2, =0x352608          // rbg_data
    ldr  r3, [r2]
    str  r3, [r1]
    adds r1, #4

    movs r3, #${sentinel}
    strb r3, [r1]
    adds r1, #1

    subs r0, #1
    bne  dump_rng
    bx   lr

notify_hci:
    push {r0-r4, lr}
    movs r2, #243
    movs r1, #0xff
    movs r0, #245
    bl   0x24e92                // bthci_event_AllocateEventAndFillHeader
    movs r4, r0

    adds r0, #10                // event parameters start here
    ldr  r1, =${marker}
    str  r1, [r0]

    movs r0, r4
    bl   0x24c36                // bthci_event_AttemptToEnqueueEventToTransport
    pop  {r0-r4, pc}
"#;

/// Bytes per record written by [`CYW20735_HARVEST`]: one RNG word and the
/// sentinel.
pub const CYW20735_RECORD_STRIDE: usize = 5;

/// Replaces the body of the ROM RNG routine. Two returns fill one patch word.
pub const NEUTRALIZE: &str = "bx lr; bx lr";

/// `rbg_rand` in ROM.
pub const CYW20735_RNG_FUNCTION: u32 = 0xa562e;

/// Launch-RAM entry in the vendor HCI command handler table.
pub const CYW20735_LAUNCH_RAM_ENTRY: u32 = 0x1425bc;

/// Patchram area free once all firmware patches are disabled.
pub const CYW20735_LOAD_ADDRESS: u32 = 0x217000;
