use nrfmprog_lib::erase_plan::ErasePlan;
use nrfmprog_lib::{DeviceFamily, MemorySegment};

#[test]
fn test_segment_within_one_page() {
    let segment = MemorySegment::new(0x1000, vec![0; 0x200]);

    let plan = ErasePlan::for_segment(&segment, DeviceFamily::Nrf51.page_size());

    assert_eq!(plan.pages(), &[0x1000]);
}

#[test]
fn test_unaligned_segment_spanning_pages() {
    let plan = ErasePlan::for_range(0x0FF0, 0x1410, 0x400);

    assert_eq!(plan.pages(), &[0x0C00, 0x1000, 0x1400]);
}

#[test]
fn test_page_aligned_end_includes_following_page() {
    // [0x1000, 0x1400) fills page 0x1000 exactly; the page at 0x1400 is
    // erased as well.
    let plan = ErasePlan::for_range(0x1000, 0x1400, 0x400);

    assert_eq!(plan.pages(), &[0x1000, 0x1400]);
}

#[test]
fn test_nrf52_page_size() {
    let segment = MemorySegment::new(0x0002_3000, vec![0; 0x2800]);

    let plan = ErasePlan::for_segment(&segment, DeviceFamily::Nrf52.page_size());

    assert_eq!(plan.pages(), &[0x0002_3000, 0x0002_4000, 0x0002_5000]);
    assert_eq!(plan.page_size(), 0x1000);
}

#[test]
fn test_pages_cover_range_without_gaps_or_duplicates() {
    let page_size = 0x400;
    for (start, end) in [(0u32, 1u64), (0x3FF, 0x401), (0x1234, 0x5678), (0x800, 0xC00)] {
        let plan = ErasePlan::for_range(start, end, page_size);
        let pages = plan.pages();

        assert_eq!(pages.first().copied(), Some(start / page_size * page_size));
        assert!(pages.last().copied().unwrap() as u64 + page_size as u64 > end - 1);
        for pair in pages.windows(2) {
            assert_eq!(pair[1] - pair[0], page_size);
        }
        assert_eq!(plan.len(), (&plan).into_iter().count());
    }
}

#[test]
fn test_segment_ending_at_top_of_address_space() {
    let segment = MemorySegment::new(0xFFFF_FC00, vec![0; 0x400]);
    assert_eq!(segment.end(), 1 << 32);

    let plan = ErasePlan::for_segment(&segment, DeviceFamily::Nrf51.page_size());

    assert_eq!(plan.pages(), &[0xFFFF_FC00]);
}

#[test]
fn test_unaligned_segment_near_top_of_address_space() {
    let segment = MemorySegment::new(0xFFFF_EF00, vec![0; 0x1100]);

    let plan = ErasePlan::for_segment(&segment, DeviceFamily::Nrf52.page_size());

    assert_eq!(plan.pages(), &[0xFFFF_E000, 0xFFFF_F000]);
}
