use attention::masks::non_pad_mask;
use attention::nystrom::segment_means;
use attention::standard::weight_row_sums;
use attention::{Attention, AttentionConfig, ForwardMode, StandardAttention};
use candle_core::{Device, Tensor};
use proptest::prelude::*;

fn lengths_strategy() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..12).prop_flat_map(|max_len| {
        let lengths = prop::collection::vec(0..=max_len, 1..4);
        lengths.prop_map(move |lengths| (max_len, lengths))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn weight_rows_sum_to_one_or_zero((max_len, lengths) in lengths_strategy()) {
        let device = Device::Cpu;
        let attention = StandardAttention::new(&AttentionConfig::standard(2, 8, 8, 0.0), &device)
            .unwrap();
        let x = Tensor::randn(0f32, 1.0, (lengths.len(), max_len, 8), &device).unwrap();
        let mask = non_pad_mask(&device, &lengths, max_len).unwrap();

        let out = attention
            .forward(&x, &x, &x, Some(&mask), &mut ForwardMode::Inference)
            .unwrap();
        let sums = weight_row_sums(&out.weights).unwrap().to_vec3::<f32>().unwrap();

        for (batch, &len) in lengths.iter().enumerate() {
            for head in &sums[batch] {
                for &sum in head {
                    if len == 0 {
                        prop_assert_eq!(sum, 0.0);
                    } else {
                        prop_assert!((sum - 1.0).abs() < 1e-5, "row sum {}", sum);
                    }
                }
            }
        }
    }

    #[test]
    fn landmarks_have_requested_count(len in 1usize..40, n_landmarks in 1usize..24) {
        let x = Tensor::randn(0f32, 1.0, (1, 2, len, 3), &Device::Cpu).unwrap();
        let landmarks = segment_means(&x, n_landmarks).unwrap();
        prop_assert_eq!(landmarks.dims(), &[1, 2, n_landmarks, 3]);
    }
}
