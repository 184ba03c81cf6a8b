use elkvm::{DescriptorTables, GuestLoader, LoadSegment, PassthroughHandlers, VmBuilder};
use elkvm_vcpu::SegmentDesc;
use kvm_ioctls::Kvm;

fn kvm_available() -> bool {
    Kvm::new().is_ok()
}

struct HaltLoop;

impl GuestLoader for HaltLoop {
    fn segments(&self) -> Vec<LoadSegment> {
        vec![LoadSegment {
            guest_addr: 0x0040_0000,
            data: vec![0xeb, 0xfe], // jmp $
            length: 0x1000,
            prot: elkvm_aspace::Prot::READ | elkvm_aspace::Prot::EXEC,
        }]
    }

    fn entry_point(&self) -> u64 {
        0x0040_0000
    }

    fn descriptor_tables(&self) -> DescriptorTables {
        DescriptorTables {
            gdt_base: 0xFFFF_8000_0010_0000,
            gdt_bytes: vec![0u8; 24],
            gdt_limit: 23,
            idt_base: 0xFFFF_8000_0020_0000,
            idt_bytes: vec![0u8; 16],
            idt_limit: 15,
            code_seg: SegmentDesc {
                selector: 0x08,
                type_: 0x0b,
                present: 1,
                s: 1,
                l: 1,
                g: 1,
                limit: 0xFFFFF,
                ..Default::default()
            },
            data_seg: SegmentDesc {
                selector: 0x10,
                type_: 0x03,
                present: 1,
                s: 1,
                g: 1,
                limit: 0xFFFFF,
                ..Default::default()
            },
            tss_seg: SegmentDesc {
                selector: 0x18,
                type_: 0x0b,
                present: 1,
                limit: 0x67,
                ..Default::default()
            },
        }
    }
}

#[test]
fn vm_builds_with_a_minimal_guest_program() {
    if !kvm_available() {
        return;
    }

    let vm = VmBuilder::new()
        .arg("prog")
        .env("HOME=/root")
        .isr_blob(0xFFFF_8000_0030_0000, vec![0xf4])
        .entry_blob(0xFFFF_8000_0040_0000, vec![0xf4])
        .signal_blob(0xFFFF_8000_0050_0000, vec![0xf4])
        .build(&HaltLoop, Box::new(PassthroughHandlers));

    assert!(vm.is_ok());
}
