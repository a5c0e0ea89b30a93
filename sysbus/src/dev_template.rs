// Copyright (c) 2022 SparrowVM Authors. All rights reserved.
//
// SparrowVM is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Per-device template descriptors handed to whatever builds the guest's
//! device tree, kernel command line and ACPI tables.

use crate::SysRes;

/// Bit set in the encoded value when an aarch64 interrupt is a shared
/// peripheral interrupt; the low 16 bits carry the SPI offset and the
/// hypervisor-side decoder adds the SPI base (32) to derive the GIC INTID.
const AARCH64_SPI_TYPE_BIT: u32 = 1 << 24;

/// Level-sensitive trigger flag in a device-tree `interrupts` property.
const FDT_IRQ_LEVEL_HIGH: u32 = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    AArch64,
}

impl Architecture {
    /// Architecture of the build host.
    pub fn host() -> Architecture {
        if cfg!(target_arch = "aarch64") {
            Architecture::AArch64
        } else {
            Architecture::X86_64
        }
    }
}

/// Encode an IRQ line number into the platform integer the hypervisor's
/// injection primitive expects.
pub fn encode_irq(arch: Architecture, irq: i32) -> u32 {
    match arch {
        Architecture::AArch64 => AARCH64_SPI_TYPE_BIT | (irq as u32 & 0xffff),
        Architecture::X86_64 => irq as u32,
    }
}

/// ACPI description of one MMIO transport, consumed by the MADT/DSDT
/// builder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AmlMmioRecord {
    pub base_addr: u64,
    pub size: u64,
    pub gsi: u32,
}

/// The transport parameters a machine advertises for one MMIO device.
#[derive(Debug, Copy, Clone)]
pub struct MmioTemplate {
    pub res: SysRes,
}

impl MmioTemplate {
    pub fn new(res: SysRes) -> MmioTemplate {
        MmioTemplate { res }
    }

    /// Device-tree node for the transport.
    pub fn fdt_node(&self) -> String {
        format!(
            concat!(
                "virtio@{:x} {{\n",
                "  compatible = \"virtio,mmio\";\n",
                "  reg = <0x{:x} 0x{:x}>;\n",
                "  interrupts = <0 {} {}>;\n",
                "  status = \"okay\";\n",
                "}};"
            ),
            self.res.region_base,
            self.res.region_base,
            self.res.region_size,
            self.res.irq,
            FDT_IRQ_LEVEL_HIGH,
        )
    }

    /// `virtio_mmio.device=` parameter for the kernel command line, used
    /// when the guest does not scan the bus window.
    pub fn kernel_cmdline_param(&self) -> String {
        format!(
            "virtio_mmio.device=4k@0x{:x}:{}",
            self.res.region_base, self.res.irq
        )
    }

    pub fn acpi_record(&self, arch: Architecture) -> AmlMmioRecord {
        AmlMmioRecord {
            base_addr: self.res.region_base,
            size: self.res.region_size,
            gsi: encode_irq(arch, self.res.irq),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> MmioTemplate {
        MmioTemplate::new(SysRes {
            region_base: 0x0a00_0000,
            region_size: 512,
            irq: 7,
        })
    }

    #[test]
    fn test_encode_irq() {
        assert_eq!(encode_irq(Architecture::X86_64, 5), 5);
        assert_eq!(encode_irq(Architecture::AArch64, 5), 0x0100_0005);
        assert_eq!(encode_irq(Architecture::AArch64, 0x1234), 0x0100_1234);
    }

    #[test]
    fn test_fdt_node() {
        let node = template().fdt_node();
        assert!(node.starts_with("virtio@a000000 {"));
        assert!(node.contains("compatible = \"virtio,mmio\";"));
        assert!(node.contains("reg = <0xa000000 0x200>;"));
        assert!(node.contains("interrupts = <0 7 4>;"));
        assert!(node.contains("status = \"okay\";"));
    }

    #[test]
    fn test_cmdline_and_acpi() {
        let t = template();
        assert_eq!(t.kernel_cmdline_param(), "virtio_mmio.device=4k@0xa000000:7");
        let rec = t.acpi_record(Architecture::X86_64);
        assert_eq!(rec.base_addr, 0x0a00_0000);
        assert_eq!(rec.size, 512);
        assert_eq!(rec.gsi, 7);
        assert_eq!(t.acpi_record(Architecture::AArch64).gsi, 0x0100_0007);
    }
}
